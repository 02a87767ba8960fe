//! A minimal synchronous MySQL client for the nocturne web server.
//!
//! Speaks the 4.1 wire protocol with `mysql_native_password` auth and the
//! text query protocol — just enough for short verification queries from a
//! bounded, semaphore-gated connection pool. No external dependencies.

pub mod auth;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod row;

pub use connection::{escape_literal, MysqlConfig, MysqlConnection};
pub use error::{MysqlError, MysqlResult};
pub use pool::{PooledConn, SqlPool};
pub use row::Row;
