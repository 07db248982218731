// src/core/engine/client.rs

//! A small asynchronous client for a single data-engine instance.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::EngineError;
use super::resp::{RespCodec, RespError, RespValue};

/// Per-connection timeouts, taken from the engine section of the config.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// One framed connection to an engine instance.
pub struct EngineClient {
    framed: Framed<TcpStream, RespCodec>,
    timeouts: ClientTimeouts,
}

impl From<RespError> for EngineError {
    fn from(err: RespError) -> Self {
        match err {
            RespError::Io(io) => EngineError::Io(io),
            RespError::Protocol(msg) => EngineError::Protocol(msg),
        }
    }
}

impl EngineClient {
    /// Connects with the dial timeout and authenticates when credentials are set.
    pub async fn connect(
        addr: &str,
        timeouts: ClientTimeouts,
        auth_user: &str,
        auth_password: &str,
    ) -> Result<Self, EngineError> {
        let stream = tokio::time::timeout(timeouts.dial, TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::Timeout("connect"))??;
        let mut client = Self {
            framed: Framed::new(stream, RespCodec),
            timeouts,
        };
        if !auth_password.is_empty() {
            let reply = if auth_user.is_empty() {
                client.command(&["AUTH", auth_password]).await?
            } else {
                client.command(&["AUTH", auth_user, auth_password]).await?
            };
            if !matches!(&reply, RespValue::Simple(s) if s == "OK") {
                return Err(EngineError::UnexpectedReply(format!("AUTH: {reply:?}")));
            }
        }
        Ok(client)
    }

    /// Sends a command frame and waits for a single reply frame.
    ///
    /// Error replies (`-ERR`, `-BUSY`, ...) are surfaced as
    /// [`EngineError::Server`] so callers can branch on the error class.
    pub async fn command(&mut self, args: &[&str]) -> Result<RespValue, EngineError> {
        let frame = RespValue::command(args);
        tokio::time::timeout(self.timeouts.write, self.framed.send(frame))
            .await
            .map_err(|_| EngineError::Timeout("write"))??;
        let reply = tokio::time::timeout(self.timeouts.read, self.framed.next())
            .await
            .map_err(|_| EngineError::Timeout("read"))?;
        match reply {
            Some(Ok(RespValue::Error(message))) => Err(EngineError::Server(message)),
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err.into()),
            None => Err(EngineError::Protocol("connection closed by peer".to_string())),
        }
    }
}
