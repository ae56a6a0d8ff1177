//! TCP connection properties: after `handle_close` no further callback
//! fires, and send order is preserved end-to-end across loop boundaries.
//! Driven through the public `TcpServer`/`TcpConnection` surface against a
//! real socket pair rather than mocked I/O.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactord::net::addr::InetAddr;
use reactord::net::connection::TcpConnection;
use reactord::{EventLoop, LoopHandle, TcpServer};

/// Starts an echo server (thread_num worker threads) on an ephemeral port
/// and returns its address plus a live count of currently-connected peers.
fn start_echo_server(thread_num: usize) -> (SocketAddr, Arc<AtomicUsize>, LoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let live = Arc::new(AtomicUsize::new(0));
    let live_for_thread = live.clone();

    let join = std::thread::spawn(move || {
        let base = EventLoop::new();
        let mut server = TcpServer::new(&base, InetAddr::loopback(0), "echo-test");
        let addr = server.listen_addr().socket_addr();

        server.set_message_callback(Arc::new(|conn, _now| {
            let bytes = conn.borrow_mut().input_mut().retrieve_all_as_vec();
            TcpConnection::send(conn, &bytes);
        }));
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.borrow().connected() {
                live_for_thread.fetch_add(1, Ordering::SeqCst);
            } else {
                live_for_thread.fetch_sub(1, Ordering::SeqCst);
            }
        }));
        server.set_thread_num(thread_num);
        server.start(&base, None);

        tx.send((addr, base.handle())).unwrap();
        base.run();
    });

    let (addr, handle) = rx.recv().unwrap();
    (addr, live, handle, join)
}

fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn send_order_is_preserved_across_loop_boundaries() {
    // One worker thread: the connection is driven by a different thread
    // than the one that accepted it, crossing the loop boundary the
    // property calls out.
    let (addr, live, handle, join) = start_echo_server(1);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));

    stream.write_all(b"abc").unwrap();
    stream.write_all(b"def").unwrap();
    stream.write_all(b"ghi").unwrap();

    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abcdefghi");

    drop(stream);
    handle.quit();
    join.join().unwrap();
}

#[test]
fn no_further_activity_follows_handle_close() {
    let (addr, live, handle, join) = start_echo_server(0);

    let stream = TcpStream::connect(addr).unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));

    drop(stream);
    assert!(
        wait_until(|| live.load(Ordering::SeqCst) == 0, Duration::from_secs(2)),
        "connection must be torn down exactly once after the peer's FIN"
    );
    // Give any spurious extra callback a chance to run, then confirm the
    // count didn't move again -- handle_close fires the disconnect
    // transition exactly once.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(live.load(Ordering::SeqCst), 0);

    handle.quit();
    join.join().unwrap();
}
