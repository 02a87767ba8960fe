//! HTTP/1.1 request parsing.
//!
//! A line-oriented state machine over the connection's input buffer. Lines
//! are consumed as they complete; a partial line (or partial body) leaves the
//! state in place so the next readiness event resumes where parsing stopped.
//!
//! Form POSTs to the login and registration pages are verified against the
//! `user` table and rewrite the target page to the success or failure view.

use std::collections::HashMap;

use nocturne_mysql::{escape_literal, SqlPool};
use tracing::{debug, warn};

use crate::buffer::Buffer;

const CRLF: &[u8] = b"\r\n";

/// Paths served as `<tag>.html`.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Result of one `parse` call over the current buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full, well-formed request is ready.
    Complete,
    /// More bytes are needed; state is preserved.
    Incomplete,
    /// The request is malformed (400).
    Error,
}

pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    post: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            post: HashMap::new(),
        }
    }

    /// Reset to a fresh request (start of a keep-alive cycle).
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.post.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
    }

    /// Header lookup, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Form field from a parsed urlencoded body.
    pub fn post_value(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(|v| v.as_str())
    }

    /// Drive the state machine over the buffer. Consumes complete lines and
    /// the body; leaves partial input for the next call.
    pub fn parse(&mut self, buff: &mut Buffer, db: &SqlPool) -> ParseOutcome {
        loop {
            match self.state {
                ParseState::Finish => return ParseOutcome::Complete,
                ParseState::Body => {
                    let need = self.content_length();
                    if buff.readable() < need {
                        return ParseOutcome::Incomplete;
                    }
                    self.body = String::from_utf8_lossy(&buff.peek()[..need]).into_owned();
                    buff.retrieve(need);
                    self.parse_post(db);
                    self.state = ParseState::Finish;
                }
                ParseState::RequestLine | ParseState::Headers => {
                    let line_end = match find_crlf(buff.peek()) {
                        Some(pos) => pos,
                        None => return ParseOutcome::Incomplete,
                    };
                    let line = String::from_utf8_lossy(&buff.peek()[..line_end]).into_owned();
                    buff.retrieve(line_end + CRLF.len());

                    if self.state == ParseState::RequestLine {
                        if !self.parse_request_line(&line) {
                            return ParseOutcome::Error;
                        }
                        self.parse_path();
                        self.state = ParseState::Headers;
                    } else if line.is_empty() {
                        // Blank line ends the header section.
                        self.state = ParseState::Body;
                    } else {
                        self.parse_header(&line);
                    }
                }
            }
        }
    }

    fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) if parts.next().is_none() => (m, p, v),
            _ => {
                warn!("bad request line: {:?}", line);
                return false;
            }
        };
        let version = match version.strip_prefix("HTTP/") {
            Some(v) if !v.is_empty() => v,
            _ => {
                warn!("bad request line: {:?}", line);
                return false;
            }
        };
        if method.is_empty() || path.is_empty() {
            warn!("bad request line: {:?}", line);
            return false;
        }
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        debug!("request line: {} {} HTTP/{}", method, path, version);
        true
    }

    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                self.headers
                    .insert(name.to_string(), value.trim_start().to_string());
            }
            // A colon-less line before the blank separator: tolerate it and
            // treat the header section as finished.
            None => self.state = ParseState::Body,
        }
    }

    fn parse_path(&mut self) {
        if self.path.ends_with('/') {
            self.path.push_str("index.html");
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_post(&mut self, db: &SqlPool) {
        if self.method != "POST" {
            return;
        }
        let form = self
            .header("Content-Type")
            .map(|v| v.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !form {
            return;
        }

        self.post = parse_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let username = self.post.get("username").cloned().unwrap_or_default();
        let password = self.post.get("password").cloned().unwrap_or_default();
        if user_verify(&username, &password, is_login, db) {
            self.path = "/welcome.html".to_string();
        } else {
            self.path = "/error.html".to_string();
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Decode an `application/x-www-form-urlencoded` body into key/value pairs.
fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(percent_decode(key), percent_decode(value));
    }
    map
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = bytes.get(i + 1).copied().and_then(hex_val);
                let lo = bytes.get(i + 2).copied().and_then(hex_val);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    // Stray '%': pass through rather than reject the form.
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Check credentials against the `user` table. Login verifies the stored
/// password; registration requires a free username and inserts the row.
pub fn user_verify(name: &str, pwd: &str, is_login: bool, db: &SqlPool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }
    let mut conn = match db.get() {
        Ok(conn) => conn,
        Err(e) => {
            warn!("user verify unavailable: {}", e);
            return false;
        }
    };

    let query = format!(
        "SELECT username, password FROM user WHERE username='{}' LIMIT 1",
        escape_literal(name)
    );
    let rows = match conn.query(&query) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("user query failed: {}", e);
            return false;
        }
    };

    if is_login {
        match rows.first() {
            Some(row) => {
                let stored = row.get(1).ok().flatten().unwrap_or_default();
                if stored == pwd {
                    true
                } else {
                    warn!("failed login for user {:?}", name);
                    false
                }
            }
            None => {
                warn!("failed login for unknown user {:?}", name);
                false
            }
        }
    } else {
        if !rows.is_empty() {
            warn!("registration rejected, user {:?} exists", name);
            return false;
        }
        let insert = format!(
            "INSERT INTO user(username, password) VALUES('{}', '{}')",
            escape_literal(name),
            escape_literal(pwd)
        );
        match conn.execute(&insert) {
            Ok(_) => true,
            Err(e) => {
                warn!("registration insert failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> Buffer {
        let mut buff = Buffer::new();
        buff.append(bytes);
        buff
    }

    #[test]
    fn test_parse_complete_get() {
        let db = SqlPool::empty();
        let mut buff =
            buffer_with(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert!(req.is_keep_alive());
        assert_eq!(buff.readable(), 0);
    }

    #[test]
    fn test_parse_incomplete_resumes_across_calls() {
        let db = SqlPool::empty();
        let mut buff = buffer_with(b"GET / HTTP/1.1\r\nHost: x");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Incomplete);
        assert_eq!(req.state(), ParseState::Headers);

        buff.append(b"\r\n\r\n");
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.header("Host"), Some("x"));
    }

    #[test]
    fn test_malformed_request_line() {
        let db = SqlPool::empty();
        let mut buff = buffer_with(b"GARBAGE\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Error);
    }

    #[test]
    fn test_tag_paths_get_html_suffix() {
        let db = SqlPool::empty();
        for (raw, resolved) in [
            ("/", "/index.html"),
            ("/login", "/login.html"),
            ("/register", "/register.html"),
            ("/static/", "/static/index.html"),
            ("/nope", "/nope"),
        ] {
            let raw_line = format!("GET {} HTTP/1.1\r\n\r\n", raw);
            let mut buff = buffer_with(raw_line.as_bytes());
            let mut req = HttpRequest::new();
            assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
            assert_eq!(req.path(), resolved);
        }
    }

    #[test]
    fn test_keep_alive_requires_1_1_and_header() {
        let db = SqlPool::empty();
        let mut buff = buffer_with(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let mut req = HttpRequest::new();
        req.parse(&mut buff, &db);
        assert!(!req.is_keep_alive());

        let mut buff = buffer_with(b"GET / HTTP/1.1\r\nconnection: Keep-Alive\r\n\r\n");
        let mut req = HttpRequest::new();
        req.parse(&mut buff, &db);
        assert!(req.is_keep_alive());

        let mut buff = buffer_with(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let mut req = HttpRequest::new();
        req.parse(&mut buff, &db);
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_urlencoded_body_decoded() {
        let db = SqlPool::empty();
        let body = "username=a%26b&password=p+w%21";
        let raw = format!(
            "POST /nope HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buff = buffer_with(raw.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
        assert_eq!(req.post_value("username"), Some("a&b"));
        assert_eq!(req.post_value("password"), Some("p w!"));
        // Non-auth path: no rewrite.
        assert_eq!(req.path(), "/nope");
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let db = SqlPool::empty();
        let raw = b"POST /nope HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345";
        let mut buff = buffer_with(raw);
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Incomplete);
        assert_eq!(req.state(), ParseState::Body);

        buff.append(b"67890");
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
    }

    #[test]
    fn test_login_with_unreachable_db_fails_onto_error_page() {
        let db = SqlPool::empty();
        let body = "username=alice&password=pw";
        let raw = format!(
            "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buff = buffer_with(raw.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff, &db), ParseOutcome::Complete);
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_init_resets_state() {
        let db = SqlPool::empty();
        let mut buff = buffer_with(b"GET /welcome HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = HttpRequest::new();
        req.parse(&mut buff, &db);
        req.init();
        assert_eq!(req.state(), ParseState::RequestLine);
        assert_eq!(req.path(), "");
        assert!(req.header("Host").is_none());
    }
}
