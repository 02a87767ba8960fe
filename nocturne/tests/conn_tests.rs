//! Connection round trips over a socketpair: request bytes in, response
//! bytes out, without a live reactor.

use std::fs;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nocturne::conn::{ConnContext, HttpConn};
use nocturne::request::ParseState;
use nocturne_mysql::SqlPool;

fn temp_root(tag: &str) -> PathBuf {
    use std::sync::atomic::AtomicUsize;
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "nocturne-conn-{}-{}-{}",
        tag,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_ctx(root: PathBuf) -> Arc<ConnContext> {
    Arc::new(ConnContext::new(root, true, SqlPool::empty()))
}

/// Server-side connection on one end of a socketpair, client stream on the
/// other. The server fd is non-blocking so edge-triggered read loops stop
/// at EAGAIN.
fn connected_pair(ctx: &Arc<ConnContext>) -> (HttpConn, UnixStream) {
    let (server, client) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut conn = HttpConn::new(Arc::clone(ctx));
    conn.init(server.into_raw_fd(), "127.0.0.1:1".parse().unwrap());
    (conn, client)
}

/// Read one HTTP response: headers through CRLFCRLF, then exactly
/// `Content-length` body bytes.
fn read_response(client: &mut UnixStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).expect("headers truncated");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .expect("missing Content-length");
    let mut body = vec![0u8; content_length];
    client.read_exact(&mut body).expect("body truncated");
    (head, body)
}

#[test]
fn test_keep_alive_get_round_trip() {
    let root = temp_root("keepalive");
    fs::write(root.join("index.html"), b"<html>front page</html>").unwrap();
    let ctx = make_ctx(root.clone());
    let (mut conn, mut client) = connected_pair(&ctx);

    for _ in 0..2 {
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();

        let n = conn.read().unwrap();
        assert!(n > 0);
        assert!(conn.process(), "complete request must be ready to write");
        assert!(conn.to_write_bytes() > 0);

        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);

        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, b"<html>front page</html>");

        // Drained keep-alive connection is reset for the next request.
        assert_eq!(conn.request().state(), ParseState::RequestLine);
        assert!(conn.response().file().is_none());
        assert!(!conn.is_closed());
    }

    // Still exactly one live connection.
    assert_eq!(ctx.user_count.load(Ordering::Relaxed), 1);

    conn.close();
    assert_eq!(ctx.user_count.load(Ordering::Relaxed), 0);
    fs::remove_dir_all(&root).ok();
}

#[test]
fn test_unknown_path_is_404_and_closes() {
    let root = temp_root("notfound");
    let ctx = make_ctx(root.clone());
    let (mut conn, mut client) = connected_pair(&ctx);

    client
        .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    conn.read().unwrap();
    assert!(conn.process());
    conn.write().unwrap();
    assert_eq!(conn.to_write_bytes(), 0);
    assert!(!conn.is_keep_alive());

    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {}", head);
    assert!(String::from_utf8_lossy(&body).contains("404 : Not Found"));

    // The reactor closes non-keep-alive connections after the drain.
    conn.close();
    conn.close(); // idempotent
    assert_eq!(ctx.user_count.load(Ordering::Relaxed), 0);
    fs::remove_dir_all(&root).ok();
}

#[test]
fn test_malformed_request_is_400() {
    let root = temp_root("badreq");
    let ctx = make_ctx(root.clone());
    let (mut conn, mut client) = connected_pair(&ctx);

    client.write_all(b"GARBAGE\r\n\r\n").unwrap();

    conn.read().unwrap();
    assert!(conn.process());
    conn.write().unwrap();

    let (head, _) = read_response(&mut client);
    assert!(
        head.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "head: {}",
        head
    );
    assert!(!conn.is_keep_alive());

    conn.close();
    fs::remove_dir_all(&root).ok();
}

#[test]
fn test_partial_request_waits_for_more_bytes() {
    let root = temp_root("partial");
    fs::write(root.join("index.html"), b"x").unwrap();
    let ctx = make_ctx(root.clone());
    let (mut conn, mut client) = connected_pair(&ctx);

    client.write_all(b"GET /index.html HTT").unwrap();
    conn.read().unwrap();
    assert!(!conn.process(), "incomplete request must re-arm for read");

    client.write_all(b"P/1.1\r\nHost: x\r\n\r\n").unwrap();
    conn.read().unwrap();
    assert!(conn.process());
    conn.write().unwrap();

    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"x");

    conn.close();
    fs::remove_dir_all(&root).ok();
}

#[test]
fn test_peer_eof_reports_zero() {
    let root = temp_root("eof");
    let ctx = make_ctx(root.clone());
    let (mut conn, client) = connected_pair(&ctx);

    drop(client);
    assert_eq!(conn.read().unwrap(), 0);

    conn.close();
    fs::remove_dir_all(&root).ok();
}

#[test]
fn test_empty_buffer_process_is_noop() {
    let root = temp_root("noop");
    let ctx = make_ctx(root.clone());
    let (mut conn, _client) = connected_pair(&ctx);

    assert!(!conn.process());
    conn.close();
    fs::remove_dir_all(&root).ok();
}
