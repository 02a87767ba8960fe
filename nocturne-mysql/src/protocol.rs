//! MySQL client/server wire protocol definitions and codecs.
//!
//! Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/PAGE_PROTOCOL.html
//!
//! Every packet on the wire is a 3-byte little-endian payload length, a
//! 1-byte sequence id, then the payload. The codecs here operate on payload
//! byte slices; framing lives in `connection.rs`.

use crate::error::{MysqlError, MysqlResult};

/// Capability flags the client advertises in HandshakeResponse41.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
}

/// Text-protocol command bytes (first payload byte of a command packet).
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
}

/// First-byte markers of server response payloads.
pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;
pub const NULL_VALUE: u8 = 0xfb;

/// The only auth plugin this client speaks.
pub const NATIVE_AUTH_PLUGIN: &str = "mysql_native_password";

/// Maximum packet size advertised to the server (16 MiB).
pub const MAX_PACKET_SIZE: u32 = 0x0100_0000;

/// utf8_general_ci.
pub const CHARSET_UTF8: u8 = 33;

// ─── Payload readers ──────────────────────────────────────────

/// Cursor over a packet payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> MysqlResult<u8> {
        if self.remaining() < 1 {
            return Err(truncated());
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> MysqlResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> MysqlResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> MysqlResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(truncated());
        }
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    pub fn skip(&mut self, n: usize) -> MysqlResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// NUL-terminated string.
    pub fn read_cstring(&mut self) -> MysqlResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(truncated)?;
        let s = &rest[..nul];
        self.pos += nul + 1;
        Ok(s)
    }

    /// Length-encoded integer.
    pub fn read_lenenc_int(&mut self) -> MysqlResult<u64> {
        let first = self.read_u8()?;
        match first {
            0..=0xfa => Ok(first as u64),
            0xfc => {
                let b = self.read_bytes(2)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u64)
            }
            0xfd => {
                let b = self.read_bytes(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xfe => {
                let b = self.read_bytes(8)?;
                Ok(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            _ => Err(MysqlError::Protocol(format!(
                "invalid length-encoded integer prefix 0x{:02x}",
                first
            ))),
        }
    }

    /// Length-encoded string; `None` encodes SQL NULL (0xfb) in row data.
    pub fn read_lenenc_string(&mut self) -> MysqlResult<Option<&'a [u8]>> {
        if self.remaining() >= 1 && self.buf[self.pos] == NULL_VALUE {
            self.pos += 1;
            return Ok(None);
        }
        let len = self.read_lenenc_int()? as usize;
        Ok(Some(self.read_bytes(len)?))
    }
}

fn truncated() -> MysqlError {
    MysqlError::Protocol("truncated packet".to_string())
}

// ─── Decoded server packets ───────────────────────────────────

/// Initial HandshakeV10 packet from the server.
#[derive(Debug)]
pub struct Handshake {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    /// 20-byte auth challenge (part 1 + part 2).
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

pub fn parse_handshake(payload: &[u8]) -> MysqlResult<Handshake> {
    let mut r = PayloadReader::new(payload);

    let protocol_version = r.read_u8()?;
    if protocol_version != 10 {
        return Err(MysqlError::Protocol(format!(
            "unsupported handshake protocol version {}",
            protocol_version
        )));
    }

    let server_version = String::from_utf8_lossy(r.read_cstring()?).into_owned();
    let connection_id = r.read_u32()?;

    let mut auth_data = r.read_bytes(8)?.to_vec();
    r.skip(1)?; // filler

    let cap_low = r.read_u16()? as u32;
    let mut capabilities = cap_low;
    let mut auth_plugin = String::new();

    // Everything past this point is optional on ancient servers.
    if r.remaining() > 0 {
        r.skip(1)?; // character set
        r.skip(2)?; // status flags
        let cap_high = r.read_u16()? as u32;
        capabilities |= cap_high << 16;

        let auth_data_len = r.read_u8()? as usize;
        r.skip(10)?; // reserved

        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            // Part 2 is max(13, len - 8) bytes; the 20-byte scramble is
            // part 1 (8) + the first 12 of part 2, the 13th is a NUL.
            let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8));
            let part2 = r.read_bytes(part2_len)?;
            auth_data.extend_from_slice(&part2[..12.min(part2.len())]);
        }
        if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            auth_plugin = String::from_utf8_lossy(r.read_cstring()?).into_owned();
        }
    }

    Ok(Handshake {
        server_version,
        connection_id,
        capabilities,
        auth_data,
        auth_plugin,
    })
}

/// OK packet fields the client cares about.
#[derive(Debug, Default, Clone, Copy)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

pub fn parse_ok(payload: &[u8]) -> MysqlResult<OkPacket> {
    let mut r = PayloadReader::new(payload);
    r.skip(1)?; // 0x00 header
    let affected_rows = r.read_lenenc_int()?;
    let last_insert_id = r.read_lenenc_int()?;
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
    })
}

pub fn parse_err(payload: &[u8]) -> MysqlError {
    let mut r = PayloadReader::new(payload);
    let _ = r.skip(1); // 0xff header
    let code = r.read_u16().unwrap_or(0);
    let mut sqlstate = String::new();
    // PROTOCOL_41 inserts "#xxxxx" before the message.
    if r.remaining() > 0 && r.rest()[0] == b'#' {
        let _ = r.skip(1);
        if let Ok(b) = r.read_bytes(5) {
            sqlstate = String::from_utf8_lossy(b).into_owned();
        }
    }
    let message = String::from_utf8_lossy(r.rest()).into_owned();
    MysqlError::Server {
        code,
        sqlstate,
        message,
    }
}

/// True when the payload is an EOF packet (0xfe header, short body).
pub fn is_eof(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() < 9
}

// ─── Payload writers ──────────────────────────────────────────

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_cstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

/// HandshakeResponse41 payload.
pub fn encode_handshake_response(
    client_flags: u32,
    user: &str,
    auth_response: &[u8],
    database: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + user.len() + database.len());
    write_u32(&mut out, client_flags);
    write_u32(&mut out, MAX_PACKET_SIZE);
    out.push(CHARSET_UTF8);
    out.extend_from_slice(&[0u8; 23]);
    write_cstring(&mut out, user.as_bytes());
    // CLIENT_SECURE_CONNECTION: 1-byte length + auth data.
    out.push(auth_response.len() as u8);
    out.extend_from_slice(auth_response);
    if client_flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        write_cstring(&mut out, database.as_bytes());
    }
    if client_flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        write_cstring(&mut out, NATIVE_AUTH_PLUGIN.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenenc_int() {
        let mut r = PayloadReader::new(&[0x2a]);
        assert_eq!(r.read_lenenc_int().unwrap(), 42);

        let mut r = PayloadReader::new(&[0xfc, 0x34, 0x12]);
        assert_eq!(r.read_lenenc_int().unwrap(), 0x1234);

        let mut r = PayloadReader::new(&[0xfd, 0x56, 0x34, 0x12]);
        assert_eq!(r.read_lenenc_int().unwrap(), 0x123456);

        let mut r = PayloadReader::new(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r.read_lenenc_int().unwrap(), 1);
    }

    #[test]
    fn test_lenenc_string_and_null() {
        let mut r = PayloadReader::new(&[0x03, b'a', b'b', b'c', 0xfb]);
        assert_eq!(r.read_lenenc_string().unwrap(), Some(&b"abc"[..]));
        assert_eq!(r.read_lenenc_string().unwrap(), None);
    }

    #[test]
    fn test_parse_err_packet() {
        // 0xff, code 1045, "#28000", message
        let mut payload = vec![0xff, 0x15, 0x04];
        payload.extend_from_slice(b"#28000Access denied");
        match parse_err(&payload) {
            MysqlError::Server {
                code,
                sqlstate,
                message,
            } => {
                assert_eq!(code, 1045);
                assert_eq!(sqlstate, "28000");
                assert_eq!(message, "Access denied");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parse_handshake_v10() {
        let mut payload = vec![10u8];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&7u32.to_le_bytes()); // connection id
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // auth part 1
        payload.push(0); // filler
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH;
        payload.extend_from_slice(&(caps as u16).to_le_bytes());
        payload.push(CHARSET_UTF8);
        payload.extend_from_slice(&0u16.to_le_bytes()); // status
        payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        payload.push(21); // auth data total length
        payload.extend_from_slice(&[0u8; 10]); // reserved
        payload.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        payload.extend_from_slice(b"mysql_native_password\0");

        let hs = parse_handshake(&payload).unwrap();
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 7);
        assert_eq!(hs.auth_plugin, NATIVE_AUTH_PLUGIN);
        assert_eq!(
            hs.auth_data,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]
        );
    }

    #[test]
    fn test_eof_detection() {
        assert!(is_eof(&[0xfe, 0, 0, 0x02, 0]));
        // A row whose first column is a long lenenc string is not EOF.
        assert!(!is_eof(&[0xfe, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]));
    }
}
