//! Blocking MysqlConnection — connects, authenticates, and queries MySQL.
//!
//! This is a synchronous implementation meant to be owned by a bounded pool
//! and borrowed by worker threads for short verification queries. It speaks
//! the text protocol only (COM_QUERY); prepared statements are not needed
//! for the two queries the server issues.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::auth::scramble_native;
use crate::error::{MysqlError, MysqlResult};
use crate::protocol::{self, capabilities, command, PayloadReader};
use crate::row::Row;
use std::sync::Arc;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl MysqlConfig {
    pub fn new(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A synchronous MySQL connection.
pub struct MysqlConnection {
    stream: TcpStream,
    /// Sequence id of the next packet within the current command.
    seq: u8,
    server_version: String,
}

impl MysqlConnection {
    /// Connect to the server and complete authentication.
    pub fn connect(config: &MysqlConfig) -> MysqlResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let mut last_err = MysqlError::ConnectionClosed;
        let mut stream = None;
        for resolved in std::net::ToSocketAddrs::to_socket_addrs(&addr)? {
            match TcpStream::connect_timeout(&resolved, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = MysqlError::Io(e),
            }
        }
        let stream = stream.ok_or(last_err)?;
        stream.set_nodelay(true).ok();

        let mut conn = Self {
            stream,
            seq: 0,
            server_version: String::new(),
        };
        conn.handshake(config)?;
        Ok(conn)
    }

    /// Perform the HandshakeV10 / HandshakeResponse41 exchange.
    fn handshake(&mut self, config: &MysqlConfig) -> MysqlResult<()> {
        let payload = self.read_packet()?;
        if !payload.is_empty() && payload[0] == protocol::ERR_HEADER {
            return Err(protocol::parse_err(&payload));
        }
        let hs = protocol::parse_handshake(&payload)?;
        self.server_version = hs.server_version;

        if hs.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(MysqlError::Protocol(
                "server does not speak protocol 4.1".to_string(),
            ));
        }
        // A server defaulting to another plugin (caching_sha2_password) may
        // still accept native auth; the auth-switch path below decides.
        let client_flags = capabilities::CLIENT_LONG_PASSWORD
            | capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_TRANSACTIONS
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH;

        let token = scramble_native(config.password.as_bytes(), &hs.auth_data);
        let response = protocol::encode_handshake_response(
            client_flags,
            &config.user,
            &token,
            &config.database,
        );
        self.write_packet(&response)?;

        // OK, ERR, or AuthSwitchRequest.
        loop {
            let payload = self.read_packet()?;
            match payload.first().copied() {
                Some(protocol::OK_HEADER) => return Ok(()),
                Some(protocol::ERR_HEADER) => return Err(protocol::parse_err(&payload)),
                Some(protocol::EOF_HEADER) => {
                    // AuthSwitchRequest: plugin name + fresh 20-byte nonce.
                    let mut r = PayloadReader::new(&payload);
                    r.skip(1)?;
                    let plugin = String::from_utf8_lossy(r.read_cstring()?).into_owned();
                    if plugin != protocol::NATIVE_AUTH_PLUGIN {
                        return Err(MysqlError::Auth(format!(
                            "unsupported auth plugin: {}",
                            plugin
                        )));
                    }
                    let mut nonce = r.rest().to_vec();
                    if nonce.last() == Some(&0) {
                        nonce.pop();
                    }
                    let token = scramble_native(config.password.as_bytes(), &nonce);
                    self.write_packet(&token)?;
                }
                _ => {
                    return Err(MysqlError::Protocol(
                        "unexpected packet during authentication".to_string(),
                    ))
                }
            }
        }
    }

    // ─── Query Methods ────────────────────────────────────────

    /// Execute a query and collect all result rows (text protocol).
    /// Statements that return no resultset yield an empty vector.
    pub fn query(&mut self, sql: &str) -> MysqlResult<Vec<Row>> {
        self.send_command(command::COM_QUERY, sql.as_bytes())?;

        let payload = self.read_packet()?;
        match payload.first().copied() {
            Some(protocol::OK_HEADER) => return Ok(Vec::new()),
            Some(protocol::ERR_HEADER) => return Err(protocol::parse_err(&payload)),
            None => return Err(MysqlError::Protocol("empty response".to_string())),
            _ => {}
        }

        let mut r = PayloadReader::new(&payload);
        let column_count = r.read_lenenc_int()? as usize;

        // Column definitions: the name is the fifth length-encoded string.
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = self.read_packet()?;
            let mut r = PayloadReader::new(&def);
            for _ in 0..4 {
                r.read_lenenc_string()?; // catalog, schema, table, org_table
            }
            let name = r
                .read_lenenc_string()?
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            columns.push(name);
        }
        let columns = Arc::new(columns);

        // EOF terminates the column definitions.
        let eof = self.read_packet()?;
        if !protocol::is_eof(&eof) {
            return Err(MysqlError::Protocol(
                "expected EOF after column definitions".to_string(),
            ));
        }

        // Row packets until the closing EOF (or ERR mid-stream).
        let mut rows = Vec::new();
        loop {
            let payload = self.read_packet()?;
            if protocol::is_eof(&payload) {
                return Ok(rows);
            }
            if payload.first() == Some(&protocol::ERR_HEADER) {
                return Err(protocol::parse_err(&payload));
            }
            let mut r = PayloadReader::new(&payload);
            let mut values = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let v = r
                    .read_lenenc_string()?
                    .map(|b| String::from_utf8_lossy(b).into_owned());
                values.push(v);
            }
            rows.push(Row::new(Arc::clone(&columns), values));
        }
    }

    /// Execute a query expecting exactly one row.
    pub fn query_one(&mut self, sql: &str) -> MysqlResult<Row> {
        self.query(sql)?.into_iter().next().ok_or(MysqlError::NoRows)
    }

    /// Execute a statement that returns no rows (INSERT, UPDATE, DELETE).
    /// Returns the number of affected rows from the OK packet.
    pub fn execute(&mut self, sql: &str) -> MysqlResult<u64> {
        self.send_command(command::COM_QUERY, sql.as_bytes())?;
        let payload = self.read_packet()?;
        match payload.first().copied() {
            Some(protocol::OK_HEADER) => Ok(protocol::parse_ok(&payload)?.affected_rows),
            Some(protocol::ERR_HEADER) => Err(protocol::parse_err(&payload)),
            _ => Err(MysqlError::Protocol(
                "expected OK packet for statement".to_string(),
            )),
        }
    }

    /// Liveness check (COM_PING).
    pub fn ping(&mut self) -> MysqlResult<()> {
        self.send_command(command::COM_PING, &[])?;
        let payload = self.read_packet()?;
        match payload.first().copied() {
            Some(protocol::OK_HEADER) => Ok(()),
            Some(protocol::ERR_HEADER) => Err(protocol::parse_err(&payload)),
            _ => Err(MysqlError::Protocol("unexpected ping reply".to_string())),
        }
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    // ─── Internal Methods ─────────────────────────────────────

    fn send_command(&mut self, cmd: u8, arg: &[u8]) -> MysqlResult<()> {
        // Each command starts a fresh sequence.
        self.seq = 0;
        let mut payload = Vec::with_capacity(1 + arg.len());
        payload.push(cmd);
        payload.extend_from_slice(arg);
        self.write_packet(&payload)
    }

    fn read_packet(&mut self) -> MysqlResult<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MysqlError::ConnectionClosed
            } else {
                MysqlError::Io(e)
            }
        })?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        if len == 0xff_ffff {
            return Err(MysqlError::Protocol(
                "multi-packet payloads not supported".to_string(),
            ));
        }
        Ok(payload)
    }

    fn write_packet(&mut self, payload: &[u8]) -> MysqlResult<()> {
        if payload.len() >= 0xff_ffff {
            return Err(MysqlError::Protocol("packet too large".to_string()));
        }
        let len = (payload.len() as u32).to_le_bytes();
        let header = [len[0], len[1], len[2], self.seq];
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        Ok(())
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        // Best-effort COM_QUIT; the server also handles abrupt closes.
        self.seq = 0;
        let _ = self.write_packet(&[command::COM_QUIT]);
    }
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_literal(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for ch in input.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out
}
