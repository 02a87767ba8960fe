//! A small HTTP/1.1 web server built directly on epoll.
//!
//! One reactor thread owns the listen socket, the poller, the deadline heap
//! and the connection table; a fixed worker pool does the parsing, response
//! building and socket I/O; static files ride a zero-copy mmap vector; a
//! login/registration flow checks credentials against MySQL.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod epoll;
pub mod error;
pub mod logging;
pub mod pool;
pub mod request;
pub mod response;
pub mod server;
pub mod timer;

pub use buffer::Buffer;
pub use config::Config;
pub use conn::{ConnContext, HttpConn};
pub use epoll::Epoller;
pub use error::{ServerError, ServerResult};
pub use logging::init_logging;
pub use pool::ThreadPool;
pub use request::{HttpRequest, ParseOutcome, ParseState};
pub use response::HttpResponse;
pub use server::WebServer;
pub use timer::HeapTimer;
