//! Listening socket plus its readable channel, owned by the base loop.
//!
//! Grounded on `Acceptor`: a nonblocking `SOCK_STREAM` socket with
//! `SO_REUSEADDR`/`SO_REUSEPORT`, an idle `/dev/null` fd held in reserve so a
//! burst of connections that exhausts the process's fd table can still be
//! drained (accept, close, report nothing) instead of spinning the loop on
//! a readable listening socket it can never clear.

use std::os::unix::io::{AsRawFd, RawFd};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::channel::{self, Channel};
use crate::event_loop::EventLoopInner;
use crate::net::addr::InetAddr;
use crate::sys::socket::Socket;

pub type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddr)>;

pub struct Acceptor {
    socket: Socket,
    channel: Rc<RefCell<Channel>>,
    new_connection_callback: Option<NewConnectionCallback>,
    listening: bool,
    idle_fd: RawFd,
}

impl Acceptor {
    pub fn new(loop_: Weak<RefCell<EventLoopInner>>, addr: InetAddr, reuse_port: bool) -> Acceptor {
        let socket = create_nonblocking_socket(&addr).unwrap_or_else(|e| crate::error::fatal("creating listening socket", &e));
        socket
            .set_reuseaddr(true)
            .unwrap_or_else(|e| tracing::warn!(error = %e, "SO_REUSEADDR failed"));
        if reuse_port {
            socket
                .set_reuseport(true)
                .unwrap_or_else(|e| tracing::warn!(error = %e, "SO_REUSEPORT failed"));
        }
        socket
            .bind(&addr.socket_addr())
            .unwrap_or_else(|e| crate::error::fatal("binding listening socket", &e));

        let channel = Channel::new(loop_, socket.as_raw_fd());

        let idle_fd = open_dev_null().unwrap_or_else(|e| crate::error::fatal("opening /dev/null", &e));

        Acceptor {
            socket,
            channel,
            new_connection_callback: None,
            listening: false,
            idle_fd,
        }
    }

    pub fn set_new_connection_callback(&mut self, cb: NewConnectionCallback) {
        self.new_connection_callback = Some(cb);
    }

    /// The address actually bound, which differs from the requested one
    /// when the caller asked for an ephemeral port (`:0`).
    pub fn local_addr(&self) -> InetAddr {
        self.socket.local_addr().map(InetAddr::from).expect("bound listening socket has a local address")
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Must be called on the owning loop thread, after the read callback is
    /// wired up via [`Acceptor::install`].
    pub fn listen(&mut self) {
        self.listening = true;
        self.socket
            .listen(libc::SOMAXCONN)
            .unwrap_or_else(|e| crate::error::fatal("listen() failed", &e));
        channel::enable_reading(&self.channel);
    }

    fn handle_read(&mut self) {
        let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
        match self.socket.accept(
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ) {
            Ok(conn) => {
                let peer = sockaddr_in_to_addr(&storage);
                if let Some(cb) = &mut self.new_connection_callback {
                    cb(conn, peer);
                }
            }
            Err(e) => {
                if e.raw_os_error() == Some(libc::EMFILE) {
                    // Table's full: trade the idle fd for the oldest pending
                    // connection, close it immediately, then reopen the idle
                    // fd so the next burst has the same escape hatch.
                    unsafe { libc::close(self.idle_fd) };
                    let fd = unsafe { libc::accept(self.socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
                    if fd >= 0 {
                        unsafe { libc::close(fd) };
                    }
                    match open_dev_null() {
                        Ok(fd) => self.idle_fd = fd,
                        Err(e) => tracing::error!(error = %e, "failed to reopen idle fd"),
                    }
                } else {
                    tracing::warn!(error = %e, "accept() failed");
                }
            }
        }
    }

    /// Wires the channel's read callback to `handle_read`. Split from `new`
    /// because the callback needs a handle back to the (by-then-constructed)
    /// `Acceptor` itself, which only exists behind its owning `Rc<RefCell<_>>`.
    pub fn install(this: &Rc<RefCell<Acceptor>>) {
        let weak = Rc::downgrade(this);
        this.borrow().channel.borrow_mut().set_read_callback(Box::new(move |_now| {
            if let Some(this) = weak.upgrade() {
                this.borrow_mut().handle_read();
            }
        }));
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        channel::disable_all(&self.channel);
        channel::remove(&self.channel);
        unsafe { libc::close(self.idle_fd) };
    }
}

fn create_nonblocking_socket(addr: &InetAddr) -> std::io::Result<Socket> {
    let fam = if addr.ip().is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    Socket::new_raw(fam, libc::SOCK_STREAM | libc::SOCK_NONBLOCK)
}

fn open_dev_null() -> std::io::Result<RawFd> {
    let fd = crate::sys::syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(fd)
}

fn sockaddr_in_to_addr(storage: &libc::sockaddr_in) -> InetAddr {
    let ip = std::net::Ipv4Addr::from(u32::from_be(storage.sin_addr.s_addr));
    let port = u16::from_be(storage.sin_port);
    InetAddr::new(std::net::IpAddr::V4(ip), port)
}
