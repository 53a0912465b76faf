use thiserror::Error;

use crate::cipher::CipherError;

/// Failure of a card-server session. Every variant ends the session; the
/// connection loop reconnects after a backoff.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Invalid frame: {0}")]
    Framing(String),

    #[error("Checksum mismatch")]
    Checksum,

    #[error("Message too large: {0} bytes")]
    Oversize(usize),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Session closed")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;
