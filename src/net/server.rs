//! Owns the acceptor, the loop pool, and the connection index. Grounded on
//! `TcpServer.h/.cc`; see DESIGN.md for the registry split this forces.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::event_loop::{EventLoop, EventLoopInner, LoopHandle};
use crate::loop_pool::{LoopPool, ThreadInitCallback};
use crate::net::acceptor::Acceptor;
use crate::net::addr::InetAddr;
use crate::net::connection::{self, ConnectionCallback, MessageCallback, TcpConnection};

/// Logs the connection's name, peer, and new state at `info!` -- the Rust
/// analogue of `defaultConnectionCallback`.
pub fn default_connection_callback(conn: &Rc<RefCell<TcpConnection>>) {
    let conn = conn.borrow();
    tracing::info!(conn = %conn.name(), peer = %conn.peer_addr(), state = conn.state_name(), "connection state changed");
}

/// Discards whatever arrived -- the Rust analogue of `defaultMessageCallback`,
/// which just calls `retrieveAll()`.
pub fn default_message_callback(conn: &Rc<RefCell<TcpConnection>>, _now: crate::time::Timestamp) {
    let mut conn = conn.borrow_mut();
    conn.input_mut().retrieve_all();
}

pub struct TcpServer {
    base_handle: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Rc<RefCell<Acceptor>>,
    loop_pool: LoopPool,
    /// name -> owning loop's handle. Base-thread-only: the part of the
    /// registry spec.md means when it says mutation is confined to the base
    /// loop. The connection objects themselves live thread-locally on
    /// whichever loop drives them (see `net::connection::LOCAL_CONNECTIONS`).
    connections: Rc<RefCell<HashMap<String, LoopHandle>>>,
    next_conn_id: Arc<AtomicU64>,
    started: Arc<AtomicBool>,

    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
}

impl TcpServer {
    /// Must be constructed on `base`'s own thread; everything it does before
    /// `start()` (building the acceptor, the loop pool) assumes that.
    pub fn new(base: &EventLoop, listen_addr: InetAddr, name: impl Into<String>) -> TcpServer {
        let name = name.into();
        let ip_port = listen_addr.to_ip_port();

        let acceptor = Rc::new(RefCell::new(Acceptor::new(
            Rc::downgrade(base.inner()),
            listen_addr,
            true,
        )));
        Acceptor::install(&acceptor);

        let loop_pool = LoopPool::new(base, format!("{name}-io-"));

        TcpServer {
            base_handle: base.handle(),
            name,
            ip_port,
            acceptor,
            loop_pool,
            connections: Rc::new(RefCell::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            started: Arc::new(AtomicBool::new(false)),
            connection_cb: Arc::new(default_connection_callback),
            message_cb: Arc::new(default_message_callback),
        }
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = cb;
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = cb;
    }

    pub fn set_thread_num(&mut self, n: usize) {
        self.loop_pool.set_thread_num(n);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// The address actually bound, which differs from the one passed to
    /// `new` when that address asked for an ephemeral port (`:0`).
    pub fn listen_addr(&self) -> InetAddr {
        self.acceptor.borrow().local_addr()
    }

    /// Starts the loop pool, wires the acceptor's new-connection callback,
    /// then schedules `Acceptor::listen` on the base loop. Idempotent: a
    /// second call is a no-op, matching the original's `started_` guard.
    pub fn start(&mut self, base: &EventLoop, init: Option<ThreadInitCallback>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.loop_pool.start(base, init);
        let worker_handles = self.loop_pool.handles();
        let next_worker = Rc::new(RefCell::new(0usize));

        let base_handle = self.base_handle.clone();
        let connection_cb = self.connection_cb.clone();
        let message_cb = self.message_cb.clone();
        let next_conn_id = self.next_conn_id.clone();
        let server_name = self.name.clone();
        let ip_port = self.ip_port.clone();
        let connections = self.connections.clone();

        // Runs on the base thread: the acceptor's channel is registered on
        // the base loop, so its callbacks only ever fire there.
        self.acceptor.borrow_mut().set_new_connection_callback(Box::new(move |socket, peer_addr| {
            let io_handle = if worker_handles.is_empty() {
                base_handle.clone()
            } else {
                let mut idx = next_worker.borrow_mut();
                let handle = worker_handles[*idx % worker_handles.len()].clone();
                *idx = (*idx + 1) % worker_handles.len();
                handle
            };

            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            let conn_name = format!("{server_name}-{ip_port}#{conn_id}");
            let local_addr = socket.local_addr().map(InetAddr::from).unwrap_or(peer_addr);

            connections.borrow_mut().insert(conn_name.clone(), io_handle.clone());

            let connection_cb = connection_cb.clone();
            let message_cb = message_cb.clone();
            let base_handle_for_close = base_handle.clone();
            let io_handle_for_close = io_handle.clone();
            let conn_name_for_new = conn_name.clone();
            // Cloned here on the base thread (where this accept callback
            // always runs) and then moved -- never cloned again -- across
            // every thread hop below, so the base `Rc`'s strong count is
            // only ever touched from this thread.
            let connections_for_close = connections.clone();

            io_handle.queue_in_loop(move |loop_rc: &Rc<RefCell<EventLoopInner>>| {
                let weak_loop = Rc::downgrade(loop_rc);
                let conn = TcpConnection::new(
                    weak_loop,
                    conn_name_for_new.clone(),
                    socket,
                    local_addr,
                    peer_addr,
                    connection_cb,
                    message_cb,
                );

                let conn_name_for_cb = conn_name_for_new.clone();
                let mut connections_for_close = Some(connections_for_close);
                conn.borrow_mut().set_close_callback(Box::new(move |_conn| {
                    let base_handle = base_handle_for_close.clone();
                    let io_handle = io_handle_for_close.clone();
                    let conn_name = conn_name_for_cb.clone();
                    // Moves the `Rc` out rather than cloning it -- this
                    // closure runs on the io thread, and cloning here would
                    // race the base thread's own clones/drops of the same
                    // `Rc` made while accepting other connections.
                    let connections = connections_for_close.take();
                    // First hop: erase the base-side index entry.
                    base_handle.queue_in_loop(move |_base_rc| {
                        if let Some(connections) = connections {
                            connections.borrow_mut().remove(&conn_name);
                        }
                        let conn_name2 = conn_name.clone();
                        // Second hop: destroy the connection on its own
                        // loop, where its thread-local strong owner lives.
                        io_handle.queue_in_loop(move |_io_rc| {
                            if let Some(conn) = connection::take_local(&conn_name2) {
                                TcpConnection::connect_destroyed(&conn);
                            }
                        });
                    });
                }));

                connection::store_local(conn_name_for_new.clone(), conn.clone());
                TcpConnection::connect_established(&conn);
            });
        }));

        let acceptor = self.acceptor.clone();
        self.base_handle.queue_in_loop(move |_base_rc| {
            acceptor.borrow_mut().listen();
        });
    }
}
