//! Wires `http::Connection` onto a `TcpConnection`'s context slot: a
//! connection callback that attaches/detaches it and arms/cancels its idle
//! timer, and a message callback that feeds it bytes and ships the
//! response. Grounded on `onConnection`/`onMessage` in `HttpConnection.cc`.

pub mod connection;
pub mod mime;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::event_loop::EventLoopInner;
use crate::net::connection::TcpConnection;
use crate::time::Timestamp;

pub use connection::Connection;
use connection::HttpCode;

const IDLE_TIMEOUT_SECS: f64 = 60.0;

/// Connection callback: attaches a fresh `http::Connection` on connect,
/// armed with its own idle-disconnect timer; on disconnect, cancels that
/// timer so it doesn't fire into a connection that's already gone.
pub fn on_connection(conn: &Rc<RefCell<TcpConnection>>, source_dir: PathBuf) {
    if conn.borrow().connected() {
        let mut http_conn = Connection::new(source_dir);
        if let Some(loop_rc) = conn.borrow().loop_().upgrade() {
            http_conn.timer_id = Some(arm_idle_timer(conn, &loop_rc));
        }
        conn.borrow_mut().set_context(Box::new(http_conn));
    } else {
        let timer_id = conn
            .borrow_mut()
            .context_mut()
            .and_then(|c| c.downcast_mut::<Connection>())
            .and_then(|h| h.timer_id.take());
        if let (Some(id), Some(loop_rc)) = (timer_id, conn.borrow().loop_().upgrade()) {
            EventLoopInner::cancel_timer(&loop_rc, id);
        }
        tracing::debug!(conn = %conn.borrow().name(), "http connection down");
    }
}

/// Message callback: re-arms the idle timer, then drains every complete
/// request already sitting in the input buffer -- a single readable event
/// can deliver more than one pipelined request at once, and parsing only
/// the first would strand the rest until some later, possibly
/// never-arriving, read wakes the connection again. Each drained request
/// gets its response appended in order; the first non-keep-alive response
/// stops the loop and shuts the connection down.
pub fn on_message(conn: &Rc<RefCell<TcpConnection>>, _now: Timestamp) {
    let Some(loop_rc) = conn.borrow().loop_().upgrade() else {
        return;
    };
    rearm_idle_timer(conn, &loop_rc);

    let mut out = Buffer::new();
    loop {
        let parse_ret = {
            let mut c = conn.borrow_mut();
            let (input, context) = c.input_and_context_mut();
            let Some(http_conn) = context.and_then(|c| c.downcast_mut::<Connection>()) else {
                return;
            };
            http_conn.parse_request(input)
        };

        if parse_ret == HttpCode::NoRequest {
            break;
        }

        let keep_alive = {
            let mut c = conn.borrow_mut();
            let Some(http_conn) = c.context_mut().and_then(|c| c.downcast_mut::<Connection>()) else {
                return;
            };
            http_conn.make_response(&mut out, parse_ret);
            let keep = http_conn.keep_alive();
            if keep {
                http_conn.reset_state();
            }
            keep
        };

        if !keep_alive {
            TcpConnection::send(conn, &out.retrieve_all_as_vec());
            TcpConnection::shutdown(conn);
            return;
        }
    }

    if out.readable_bytes() > 0 {
        TcpConnection::send(conn, &out.retrieve_all_as_vec());
    }
}

fn arm_idle_timer(conn: &Rc<RefCell<TcpConnection>>, loop_rc: &Rc<RefCell<EventLoopInner>>) -> crate::timer::TimerId {
    let weak_conn: Weak<RefCell<TcpConnection>> = Rc::downgrade(conn);
    EventLoopInner::run_after(
        loop_rc,
        IDLE_TIMEOUT_SECS,
        Box::new(move || {
            if let Some(conn) = weak_conn.upgrade() {
                tracing::debug!(conn = %conn.borrow().name(), "idle timeout, shutting down");
                TcpConnection::shutdown(&conn);
            }
        }),
    )
}

fn rearm_idle_timer(conn: &Rc<RefCell<TcpConnection>>, loop_rc: &Rc<RefCell<EventLoopInner>>) {
    let old = conn
        .borrow_mut()
        .context_mut()
        .and_then(|c| c.downcast_mut::<Connection>())
        .and_then(|h| h.timer_id.take());
    if let Some(id) = old {
        EventLoopInner::cancel_timer(loop_rc, id);
    }

    let new_id = arm_idle_timer(conn, loop_rc);
    if let Some(http_conn) = conn.borrow_mut().context_mut().and_then(|c| c.downcast_mut::<Connection>()) {
        http_conn.timer_id = Some(new_id);
    }
}
