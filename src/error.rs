//! Error types untuk reactor, stream dan RPC

use std::io;
use thiserror::Error;

/// Error dari reactor dan transport layer
#[derive(Error, Debug)]
pub enum SioError {
    /// fd tidak valid atau poller menolak registrasi
    #[error("descriptor registration failed: {0}")]
    Registration(io::Error),

    /// Handle menunjuk descriptor yang sudah di-`del`
    #[error("stale descriptor handle")]
    StaleHandle,

    /// Operasi pada stream/socket yang sudah ditutup
    #[error("stream is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type untuk operasi reactor/stream
pub type Result<T> = std::result::Result<T, SioError>;

/// Error yang terlihat oleh pemakai RPC
#[derive(Error, Debug)]
pub enum RpcError {
    /// Semua percobaan habis tanpa response
    #[error("rpc call timed out")]
    Timeout,

    /// Client di-shutdown saat call masih berjalan
    #[error("rpc client shut down")]
    Shutdown,

    /// Tipe request sudah punya handler
    #[error("handler for request type {0} already registered")]
    DuplicateMethod(u32),
}

impl RpcError {
    /// Shutdown diperlakukan sebagai timeout oleh pemanggil
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Shutdown)
    }
}
