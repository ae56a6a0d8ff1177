//! Single-process, multi-reactor TCP networking runtime with an HTTP/1.1
//! connection state machine built on top of it.
//!
//! The reactor core -- [`event_loop`], [`channel`], [`demux`], [`timer`],
//! [`task_queue`] -- is a direct Rust rendering of a one-event-loop-per-thread
//! epoll/poll server: one [`event_loop::EventLoop`] owns a demultiplexer, a
//! timer queue, and a cross-thread task queue; [`channel::Channel`]s are the
//! fd-level units of registration; [`net`] and [`http`] build the
//! connection-handling layers on top.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod demux;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod interest;
pub mod logging;
pub mod loop_pool;
pub mod net;
mod sys;
pub mod task_queue;
pub mod time;
pub mod timer;
pub mod token;

pub use channel::Channel;
pub use error::{Error, ProtocolError};
pub use event_loop::{EventLoop, LoopHandle};
pub use interest::Ready;
pub use loop_pool::LoopPool;
pub use net::server::TcpServer;
pub use time::Timestamp;
pub use timer::TimerId;
pub use token::Token;
