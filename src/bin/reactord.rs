//! Entry point: load configuration, install logging, build the base loop
//! and server, wire the HTTP handlers on, start the loop pool, and run.
//! Mirrors `HttpServer.cc`'s `main()`.

use std::sync::Arc;

use reactord::config::Config;
use reactord::logging::{self, LogConfig};
use reactord::net::addr::InetAddr;
use reactord::{http, EventLoop, TcpServer};

fn main() {
    let mut cfg = Config::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();
    cfg.apply_args(&args);

    let _log_guard = logging::init(&LogConfig { level: cfg.log_level, log_dir: cfg.log_dir.clone() });

    tracing::info!(addr = %cfg.listen_addr, threads = cfg.thread_count, root = %cfg.resource_root.display(), "starting reactord");

    let base = EventLoop::new();
    let listen_addr = InetAddr::from(std::net::SocketAddr::V4(cfg.listen_addr));
    let mut server = TcpServer::new(&base, listen_addr, "reactord");

    let source_dir = Arc::new(cfg.resource_root.clone());
    let conn_source_dir = source_dir.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        http::on_connection(conn, (*conn_source_dir).clone());
    }));
    server.set_message_callback(Arc::new(move |conn, now| {
        http::on_message(conn, now);
    }));

    server.set_thread_num(cfg.thread_count);
    server.start(&base, None);

    base.run();
}
