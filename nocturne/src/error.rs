use thiserror::Error;

/// Fatal initialization errors. Anything that fails before the reactor loop
/// starts is reported through this type and aborts the process; runtime
/// socket errors travel as `std::io::Error` so EAGAIN stays distinguishable.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("port {0} outside the allowed range 1024-65535")]
    InvalidPort(u16),

    #[error("socket setup failed: {0}")]
    Socket(std::io::Error),

    #[error("poller setup failed: {0}")]
    Poller(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database pool init failed: {0}")]
    Database(#[from] nocturne_mysql::MysqlError),
}

pub type ServerResult<T> = Result<T, ServerError>;
