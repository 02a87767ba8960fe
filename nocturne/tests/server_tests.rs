//! End-to-end reactor test: a real listening server, real TCP clients.
//!
//! Everything shares one process-wide server (cwd and env are global), so
//! the scenarios run inside a single test function.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use nocturne::{Config, WebServer};

const PORT: u16 = 17356;

fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("headers truncated");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .expect("missing Content-length");
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("body truncated");
    (head, body)
}

fn connect() -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", PORT)).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn test_server_end_to_end() {
    let root = std::env::temp_dir().join(format!("nocturne-e2e-{}", std::process::id()));
    fs::create_dir_all(root.join("resources")).unwrap();
    fs::write(
        root.join("resources/index.html"),
        b"<html>served from disk</html>",
    )
    .unwrap();
    std::env::set_current_dir(&root).unwrap();

    std::env::set_var("NOCTURNE_PORT", PORT.to_string());
    std::env::set_var("NOCTURNE_TIMEOUT_MS", "400");
    // Point the pool at a closed port so init degrades fast instead of
    // waiting on a real database.
    std::env::set_var("NOCTURNE_SQL_HOST", "127.0.0.1");
    std::env::set_var("NOCTURNE_SQL_PORT", "1");
    std::env::set_var("NOCTURNE_SQL_POOL", "1");

    let mut server = WebServer::new(&Config::from_env()).expect("server init failed");
    thread::spawn(move || server.run());

    // Give the reactor a moment to enter its loop.
    thread::sleep(Duration::from_millis(100));

    // Keep-alive GET served twice over one connection.
    let mut stream = connect();
    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
        assert!(head.contains("Content-type: text/html\r\n"));
        assert_eq!(body, b"<html>served from disk</html>");
    }
    drop(stream);

    // Trailing slash resolves to index.html.
    let mut stream = connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert_eq!(body, b"<html>served from disk</html>");

    // Unknown path: 404 and the server closes the connection.
    let mut stream = connect();
    stream
        .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {}", head);
    assert!(String::from_utf8_lossy(&body).contains("404 : Not Found"));
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("expected EOF");
    assert!(rest.is_empty());

    // Malformed request line: 400 and close.
    let mut stream = connect();
    stream.write_all(b"GARBAGE\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(
        head.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "head: {}",
        head
    );
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("expected EOF");
    assert!(rest.is_empty());

    // Login POST with the database down: failure page target (404 here,
    // since no error.html exists under the document root).
    let mut stream = connect();
    let body = "username=alice&password=pw";
    let req = format!(
        "POST /login HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"), "head: {}", head);

    // Idle connection: the reaper closes it after the configured timeout.
    let mut stream = connect();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let start = std::time::Instant::now();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes from idle connection", n),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            panic!("idle connection was not reaped")
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "closed too early: {:?}",
        elapsed
    );
}
