/// Errors returned by nocturne-mysql operations.
#[derive(Debug)]
pub enum MysqlError {
    /// I/O error from the underlying socket.
    Io(std::io::Error),
    /// Protocol violation or unexpected packet from the server.
    Protocol(String),
    /// Authentication failure, or an auth plugin we do not speak.
    Auth(String),
    /// Server-sent ERR packet (error code, sqlstate, message).
    Server {
        code: u16,
        sqlstate: String,
        message: String,
    },
    /// Connection is closed or in an invalid state.
    ConnectionClosed,
    /// Query returned no rows when one was expected.
    NoRows,
    /// Column index or name not present in the row.
    NoColumn(String),
    /// Pool exhausted: no free handle within the acquire timeout.
    PoolTimeout,
}

impl From<std::io::Error> for MysqlError {
    fn from(e: std::io::Error) -> Self {
        MysqlError::Io(e)
    }
}

impl std::fmt::Display for MysqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MysqlError::Io(e) => write!(f, "I/O error: {}", e),
            MysqlError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            MysqlError::Auth(msg) => write!(f, "Auth error: {}", msg),
            MysqlError::Server {
                code,
                sqlstate,
                message,
            } => write!(f, "MySQL error {} ({}): {}", code, sqlstate, message),
            MysqlError::ConnectionClosed => write!(f, "Connection closed"),
            MysqlError::NoRows => write!(f, "No rows returned"),
            MysqlError::NoColumn(name) => write!(f, "No such column: {}", name),
            MysqlError::PoolTimeout => write!(f, "Connection pool acquire timed out"),
        }
    }
}

impl std::error::Error for MysqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MysqlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type MysqlResult<T> = Result<T, MysqlError>;
