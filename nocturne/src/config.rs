//! Server configuration: compiled-in defaults, each overridable from the
//! environment. The binary still starts with no arguments.

use std::time::Duration;

/// Runtime configuration for the server and its pools.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port (valid range 1024-65535).
    pub port: u16,

    /// Trigger-mode selector: 0 = LT/LT, 1 = LT listen + ET conn,
    /// 2 = ET listen + LT conn, 3 = ET/ET (default).
    pub trig_mode: u8,

    /// Per-connection idle timeout in milliseconds; 0 disables the reaper.
    pub timeout_ms: u64,

    /// SO_LINGER{1,1}: flush-within-one-second close.
    pub open_linger: bool,

    /// MySQL endpoint and credentials.
    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_password: String,
    pub db_name: String,

    /// Number of pooled database handles.
    pub conn_pool_size: usize,

    /// Number of worker threads.
    pub thread_num: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60_000,
            open_linger: false,
            sql_host: "localhost".to_string(),
            sql_port: 3306,
            sql_user: "root".to_string(),
            sql_password: "root".to_string(),
            db_name: "webserver".to_string(),
            conn_pool_size: 12,
            thread_num: 4,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// compiled-in defaults above.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            port: env_parse("NOCTURNE_PORT", d.port),
            trig_mode: env_parse("NOCTURNE_TRIG_MODE", d.trig_mode),
            timeout_ms: env_parse("NOCTURNE_TIMEOUT_MS", d.timeout_ms),
            open_linger: std::env::var("NOCTURNE_LINGER")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(d.open_linger),
            sql_host: std::env::var("NOCTURNE_SQL_HOST").unwrap_or(d.sql_host),
            sql_port: env_parse("NOCTURNE_SQL_PORT", d.sql_port),
            sql_user: std::env::var("NOCTURNE_SQL_USER").unwrap_or(d.sql_user),
            sql_password: std::env::var("NOCTURNE_SQL_PASSWORD").unwrap_or(d.sql_password),
            db_name: std::env::var("NOCTURNE_SQL_DB").unwrap_or(d.db_name),
            conn_pool_size: env_parse("NOCTURNE_SQL_POOL", d.conn_pool_size),
            thread_num: env_parse("NOCTURNE_THREADS", d.thread_num),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiled_in_defaults() {
        let c = Config::default();
        assert_eq!(c.port, 1316);
        assert_eq!(c.trig_mode, 3);
        assert_eq!(c.timeout_ms, 60_000);
        assert!(!c.open_linger);
        assert_eq!(c.sql_port, 3306);
        assert_eq!(c.conn_pool_size, 12);
        assert_eq!(c.thread_num, 4);
    }
}
