// tests/resp_test.rs

//! Framing tests for the engine client's RESP codec.

use bytes::BytesMut;
use shardkeeper::core::engine::resp::{RespCodec, RespValue};
use tokio_util::codec::{Decoder, Encoder};

fn decode_all(input: &[u8]) -> Vec<RespValue> {
    let mut codec = RespCodec;
    let mut buf = BytesMut::from(input);
    let mut out = Vec::new();
    while let Some(value) = codec.decode(&mut buf).unwrap() {
        out.push(value);
    }
    out
}

#[test]
fn encodes_commands_as_bulk_string_arrays() {
    let mut codec = RespCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(RespValue::command(&["CONFIG", "GET", "offline"]), &mut buf)
        .unwrap();
    assert_eq!(
        &buf[..],
        b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$7\r\noffline\r\n"
    );
}

#[test]
fn decodes_simple_strings_errors_and_integers() {
    let values = decode_all(b"+OK\r\n-ERR no such key\r\n:42\r\n");
    assert_eq!(
        values,
        vec![
            RespValue::Simple("OK".to_string()),
            RespValue::Error("ERR no such key".to_string()),
            RespValue::Integer(42),
        ]
    );
}

#[test]
fn decodes_bulk_strings_including_null() {
    let values = decode_all(b"$5\r\nhello\r\n$-1\r\n");
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].as_text().as_deref(), Some("hello"));
    assert_eq!(values[1], RespValue::Bulk(None));
}

#[test]
fn decodes_nested_arrays() {
    let values = decode_all(b"*2\r\n*2\r\n+a\r\n:1\r\n$2\r\nbc\r\n");
    assert_eq!(values.len(), 1);
    let RespValue::Array(Some(items)) = &values[0] else {
        panic!("expected array");
    };
    assert_eq!(items.len(), 2);
    assert!(matches!(&items[0], RespValue::Array(Some(inner)) if inner.len() == 2));
}

#[test]
fn incomplete_frames_wait_for_more_data() {
    let mut codec = RespCodec;
    let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    // nothing consumed while the frame is partial
    assert_eq!(buf.len(), 7);
    buf.extend_from_slice(b"lo\r\n");
    let value = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(value.as_text().as_deref(), Some("hello"));
    assert!(buf.is_empty());
}

#[test]
fn rejects_unknown_type_bytes() {
    let mut codec = RespCodec;
    let mut buf = BytesMut::from(&b"?oops\r\n"[..]);
    assert!(codec.decode(&mut buf).is_err());
}
