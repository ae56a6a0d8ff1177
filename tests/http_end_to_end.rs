//! The six HTTP end-to-end scenarios: a resource root with `index.html`,
//! `400.html`, `403.html`, `404.html`, a mode-000 `a.html`, and `welcome.html`
//! for the POST verification stub, served by a real `TcpServer` over a real
//! socket.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use reactord::net::addr::InetAddr;
use reactord::net::connection::{ConnectionCallback, TcpConnection};
use reactord::{http, EventLoop, LoopHandle, TcpServer};

fn write_fixtures(dir: &std::path::Path) {
    std::fs::write(dir.join("index.html"), b"<h1>Hi</h1>").unwrap();
    std::fs::write(dir.join("400.html"), b"bad request page").unwrap();
    std::fs::write(dir.join("403.html"), b"forbidden page").unwrap();
    std::fs::write(dir.join("404.html"), b"not found page").unwrap();
    std::fs::write(dir.join("welcome.html"), b"welcome page").unwrap();
    std::fs::write(dir.join("login.html"), b"login page").unwrap();

    let a_html = dir.join("a.html");
    std::fs::write(&a_html, b"unreadable").unwrap();
    std::fs::set_permissions(&a_html, std::fs::Permissions::from_mode(0o000)).unwrap();
}

fn start_server(resource_root: PathBuf) -> (SocketAddr, LoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = std::thread::spawn(move || {
        let base = EventLoop::new();
        let mut server = TcpServer::new(&base, InetAddr::loopback(0), "http-e2e");
        let addr = server.listen_addr().socket_addr();

        server.set_connection_callback(connection_callback(resource_root));
        server.set_message_callback(Arc::new(http::on_message));

        server.set_thread_num(0);
        server.start(&base, None);

        tx.send((addr, base.handle())).unwrap();
        base.run();
    });

    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, join)
}

fn connection_callback(dir: PathBuf) -> ConnectionCallback {
    Arc::new(move |conn: &Rc<RefCell<TcpConnection>>| {
        http::on_connection(conn, dir.clone());
    })
}

fn request(addr: SocketAddr, req: &[u8], read_at_least: usize) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(req).unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= read_at_least {
                    // Keep draining briefly in case more is still in flight,
                    // but don't block forever on a keep-alive connection.
                    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    buf
}

fn status_line(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    text.lines().next().unwrap_or("").to_string()
}

fn body_of(response: &[u8]) -> Vec<u8> {
    let sep = b"\r\n\r\n";
    response
        .windows(sep.len())
        .position(|w| w == sep)
        .map(|pos| response[pos + sep.len()..].to_vec())
        .unwrap_or_default()
}

#[test]
fn scenario_1_get_root_returns_index_with_close() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let resp = request(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", 1);
    assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");
    assert!(String::from_utf8_lossy(&resp).contains("Content-Type: text/html"));
    assert!(String::from_utf8_lossy(&resp).contains("Connection: close"));
    assert_eq!(body_of(&resp), b"<h1>Hi</h1>");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn scenario_2_missing_resource_returns_404_body() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let resp = request(addr, b"GET /missing HTTP/1.1\r\n\r\n", 1);
    assert_eq!(status_line(&resp), "HTTP/1.1 404 Not Found");
    assert_eq!(body_of(&resp), b"not found page");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn scenario_3_unreadable_resource_returns_403_body() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let resp = request(addr, b"GET /a HTTP/1.1\r\n\r\n", 1);
    assert_eq!(status_line(&resp), "HTTP/1.1 403 Forbidden");
    assert_eq!(body_of(&resp), b"forbidden page");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn scenario_4_malformed_request_line_returns_400_body() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let resp = request(addr, b"NOTHTTP\r\n\r\n", 1);
    assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
    assert_eq!(body_of(&resp), b"bad request page");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn scenario_5_pipelined_keep_alive_requests_both_succeed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while buf.matches("HTTP/1.1 200 OK".as_bytes()).count() < 2 && std::time::Instant::now() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let occurrences: Vec<_> = text.match_indices("HTTP/1.1 200 OK").collect();
    assert_eq!(occurrences.len(), 2, "both pipelined requests must receive a response: {text}");
    assert!(text.matches("<h1>Hi</h1>").count() >= 2);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn scenario_6_post_login_runs_verification_stub() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());
    let (addr, handle, join) = start_server(dir.path().to_path_buf());

    let req = b"POST /login.html HTTP/1.1\r\nContent-Length: 17\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nuser=a&pass=b%2Bc";
    let resp = request(addr, req, 1);
    assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");
    assert_eq!(body_of(&resp), b"welcome page");

    handle.quit();
    join.join().unwrap();
}
