//! TCP networking layer built on the reactor core: addresses, the listening
//! acceptor, the per-connection state machine, and the server that wires
//! them together.

pub mod acceptor;
pub mod addr;
pub mod connection;
pub mod server;
