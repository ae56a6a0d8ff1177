//! Per-connection state machine: `Connecting -> Connected -> Disconnecting
//! -> Disconnected`, with half-close support and an any-typed context slot
//! for a protocol layer (`http::Connection`) to ride along on.
//!
//! Grounded on `TcpConnection.h/.cc`. See DESIGN.md for the one deliberate
//! deviation from the original: connections are not stored in a cross-thread
//! shared registry, they're owned thread-locally by whichever loop drives
//! them (`LOCAL_CONNECTIONS` below), because an `Rc`'s refcount isn't atomic.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::channel::{self, Channel};
use crate::event_loop::EventLoopInner;
use crate::net::addr::InetAddr;
use crate::sys::socket::Socket;
use crate::time::Timestamp;

pub type ConnectionCallback = Arc<dyn Fn(&Rc<RefCell<TcpConnection>>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Rc<RefCell<TcpConnection>>, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Rc<RefCell<TcpConnection>>) + Send + Sync>;
type CloseCallback = Box<dyn FnMut(&Rc<RefCell<TcpConnection>>)>;

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTING: u8 = 2;
const DISCONNECTED: u8 = 3;

fn state_name(s: u8) -> &'static str {
    match s {
        CONNECTING => "connecting",
        CONNECTED => "connected",
        DISCONNECTING => "disconnecting",
        _ => "disconnected",
    }
}

thread_local! {
    /// Connections owned by this thread's loop, keyed by connection name.
    /// Inserted in `TcpServer::new_connection`'s `queue_in_loop` closure and
    /// removed in `connect_destroyed`, both on this same thread -- the
    /// strong owner that keeps a connection alive never crosses threads.
    static LOCAL_CONNECTIONS: RefCell<HashMap<String, Rc<RefCell<TcpConnection>>>> =
        RefCell::new(HashMap::new());
}

pub(crate) fn store_local(name: String, conn: Rc<RefCell<TcpConnection>>) {
    LOCAL_CONNECTIONS.with(|m| m.borrow_mut().insert(name, conn));
}

pub(crate) fn take_local(name: &str) -> Option<Rc<RefCell<TcpConnection>>> {
    LOCAL_CONNECTIONS.with(|m| m.borrow_mut().remove(name))
}

pub struct TcpConnection {
    loop_: Weak<RefCell<EventLoopInner>>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Rc<RefCell<Channel>>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input: Buffer,
    output: Buffer,
    context: Option<Box<dyn Any>>,

    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    close_cb: Option<CloseCallback>,
}

impl TcpConnection {
    /// Must be called on `loop_`'s own thread: the channel it creates is
    /// pinned to that loop for its whole life.
    pub fn new(
        loop_: Weak<RefCell<EventLoopInner>>,
        name: String,
        socket: Socket,
        local_addr: InetAddr,
        peer_addr: InetAddr,
        connection_cb: ConnectionCallback,
        message_cb: MessageCallback,
    ) -> Rc<RefCell<TcpConnection>> {
        let _ = socket.set_keepalive(true);
        let channel = Channel::new(loop_.clone(), socket.as_raw_fd());

        let conn = Rc::new(RefCell::new(TcpConnection {
            loop_,
            name,
            state: AtomicU8::new(CONNECTING),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Buffer::new(),
            output: Buffer::new(),
            context: None,
            connection_cb,
            message_cb,
            write_complete_cb: None,
            close_cb: None,
        }));

        let read_weak = Rc::downgrade(&conn);
        conn.borrow().channel.borrow_mut().set_read_callback(Box::new(move |now| {
            if let Some(conn) = read_weak.upgrade() {
                TcpConnection::handle_read(&conn, now);
            }
        }));

        let write_weak = Rc::downgrade(&conn);
        conn.borrow().channel.borrow_mut().set_write_callback(Box::new(move || {
            if let Some(conn) = write_weak.upgrade() {
                TcpConnection::handle_write(&conn);
            }
        }));

        let close_weak = Rc::downgrade(&conn);
        conn.borrow().channel.borrow_mut().set_close_callback(Box::new(move || {
            if let Some(conn) = close_weak.upgrade() {
                TcpConnection::handle_close(&conn);
            }
        }));

        let error_weak = Rc::downgrade(&conn);
        conn.borrow().channel.borrow_mut().set_error_callback(Box::new(move || {
            if let Some(conn) = error_weak.upgrade() {
                TcpConnection::handle_error(&conn);
            }
        }));

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn loop_(&self) -> &Weak<RefCell<EventLoopInner>> {
        &self.loop_
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    pub fn context(&self) -> Option<&dyn Any> {
        self.context.as_deref()
    }

    pub fn set_context(&mut self, ctx: Box<dyn Any>) {
        self.context = Some(ctx);
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.context.as_deref_mut()
    }

    /// Borrows the input buffer and the context together, since `input_mut`
    /// and `context_mut` each take `&mut self` and can't both be live at once
    /// through ordinary method calls.
    pub fn input_and_context_mut(&mut self) -> (&mut Buffer, Option<&mut (dyn Any + 'static)>) {
        (&mut self.input, self.context.as_deref_mut())
    }

    pub(crate) fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_cb = Some(cb);
    }

    /// Connecting -> Connected: ties the channel to this connection, enables
    /// reading, fires the user connection callback. Must run on the owning
    /// loop thread (the caller schedules it there via `queue_in_loop`).
    pub fn connect_established(this: &Rc<RefCell<TcpConnection>>) {
        {
            let conn = this.borrow();
            debug_assert_eq!(conn.state.load(Ordering::Acquire), CONNECTING);
        }
        this.borrow().state.store(CONNECTED, Ordering::Release);

        let weak: Weak<RefCell<dyn Any>> = Rc::downgrade(this);
        this.borrow().channel.borrow_mut().tie(weak);
        channel::enable_reading(&this.borrow().channel);

        let cb = this.borrow().connection_cb.clone();
        cb(this);
    }

    /// Removes the channel from the demux. Called exactly once, on the
    /// owning loop, as the second hop of the server's removal protocol.
    pub fn connect_destroyed(this: &Rc<RefCell<TcpConnection>>) {
        {
            let state = this.borrow().state.load(Ordering::Acquire);
            if state == CONNECTED {
                this.borrow().state.store(DISCONNECTED, Ordering::Release);
                channel::disable_all(&this.borrow().channel);
                let cb = this.borrow().connection_cb.clone();
                cb(this);
            }
        }
        channel::remove(&this.borrow().channel);
    }

    fn handle_read(this: &Rc<RefCell<TcpConnection>>, now: Timestamp) {
        let fd = this.borrow().socket.as_raw_fd();
        let result = this.borrow_mut().input.read_fd(fd);
        match result {
            Ok(0) => TcpConnection::handle_close(this),
            Ok(_) => {
                let cb = this.borrow().message_cb.clone();
                cb(this, now);
            }
            Err(e) => tracing::warn!(conn = %this.borrow().name, error = %e, "read failed"),
        }
    }

    fn handle_write(this: &Rc<RefCell<TcpConnection>>) {
        let writing = channel::is_writing(&this.borrow().channel);
        if !writing {
            tracing::trace!(conn = %this.borrow().name, "spurious write wakeup, nothing queued");
            return;
        }

        let (fd, readable) = {
            let conn = this.borrow();
            (conn.socket.as_raw_fd(), conn.output.readable_bytes())
        };
        let result = {
            let conn = this.borrow();
            conn.socket.write(conn.output.begin_read())
        };
        let _ = fd;

        match result {
            Ok(n) => {
                this.borrow_mut().output.retrieve(n);
                if this.borrow().output.readable_bytes() == 0 {
                    channel::disable_writing(&this.borrow().channel);
                    if let Some(cb) = this.borrow().write_complete_cb.clone() {
                        let this2 = this.clone();
                        if let Some(loop_rc) = this.borrow().loop_.upgrade() {
                            EventLoopInner::queue_in_loop(&loop_rc, move |_| cb(&this2));
                        }
                    }
                    if this.borrow().state.load(Ordering::Acquire) == DISCONNECTING {
                        TcpConnection::shutdown_in_loop(this);
                    }
                }
            }
            Err(e) => tracing::warn!(conn = %this.borrow().name, error = %e, "write failed"),
        }
        let _ = readable;
    }

    fn handle_close(this: &Rc<RefCell<TcpConnection>>) {
        let state = this.borrow().state.load(Ordering::Acquire);
        debug_assert!(state == CONNECTED || state == DISCONNECTING);
        this.borrow().state.store(DISCONNECTED, Ordering::Release);
        channel::disable_all(&this.borrow().channel);

        // A strong reference kept for the duration of both callbacks: the
        // close callback below removes the server's (and our own thread
        // local's) last reference, so `this` must not be the only owner
        // left when it runs.
        let guard = this.clone();

        let connection_cb = this.borrow().connection_cb.clone();
        connection_cb(&guard);

        let close_cb = this.borrow_mut().close_cb.take();
        if let Some(mut cb) = close_cb {
            cb(&guard);
            this.borrow_mut().close_cb = Some(cb);
        }
    }

    fn handle_error(this: &Rc<RefCell<TcpConnection>>) {
        let err = this.borrow().socket.take_error();
        match err {
            Ok(Some(e)) => tracing::error!(conn = %this.borrow().name, error = %e, "socket error"),
            Ok(None) => tracing::error!(conn = %this.borrow().name, "SO_ERROR reported but no error pending"),
            Err(e) => tracing::error!(conn = %this.borrow().name, error = %e, "getsockopt(SO_ERROR) failed"),
        }
    }

    pub fn send(this: &Rc<RefCell<TcpConnection>>, data: &[u8]) {
        if this.borrow().state.load(Ordering::Acquire) != CONNECTED {
            return;
        }
        let data = data.to_vec();
        let this2 = this.clone();
        if let Some(loop_rc) = this.borrow().loop_.upgrade() {
            EventLoopInner::run_in_loop(&loop_rc, move |_| {
                TcpConnection::send_in_loop(&this2, &data);
            });
        }
    }

    fn send_in_loop(this: &Rc<RefCell<TcpConnection>>, data: &[u8]) {
        if this.borrow().state.load(Ordering::Acquire) == DISCONNECTED {
            tracing::warn!(conn = %this.borrow().name, "send on a disconnected connection, dropping");
            return;
        }

        let mut remaining = data.len();
        let mut wrote = 0usize;
        let mut fault = false;

        let already_writing = channel::is_writing(&this.borrow().channel);
        let output_empty = this.borrow().output.readable_bytes() == 0;

        if !already_writing && output_empty {
            let result = this.borrow().socket.write(data);
            match result {
                Ok(n) => {
                    wrote = n;
                    remaining -= n;
                    if remaining == 0 {
                        if let Some(cb) = this.borrow().write_complete_cb.clone() {
                            let this2 = this.clone();
                            if let Some(loop_rc) = this.borrow().loop_.upgrade() {
                                EventLoopInner::queue_in_loop(&loop_rc, move |_| cb(&this2));
                            }
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::warn!(conn = %this.borrow().name, error = %e, "write failed");
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            this.borrow_mut().output.append(&data[wrote..]);
            if !channel::is_writing(&this.borrow().channel) {
                channel::enable_writing(&this.borrow().channel);
            }
        }
    }

    pub fn shutdown(this: &Rc<RefCell<TcpConnection>>) {
        let swapped = this
            .borrow()
            .state
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            let this2 = this.clone();
            if let Some(loop_rc) = this.borrow().loop_.upgrade() {
                EventLoopInner::run_in_loop(&loop_rc, move |_| {
                    TcpConnection::shutdown_in_loop(&this2);
                });
            }
        }
    }

    fn shutdown_in_loop(this: &Rc<RefCell<TcpConnection>>) {
        if !channel::is_writing(&this.borrow().channel) {
            let _ = this.borrow().socket.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn state_name(&self) -> &'static str {
        state_name(self.state.load(Ordering::Acquire))
    }
}
