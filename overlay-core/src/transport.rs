//! Framed message links between overlay processes.
//!
//! A [`Connection`] owns one TCP stream and runs two tasks over it: a drain
//! task that writes queued messages in order, and a receive task that decodes
//! incoming frames and hands them to the process's [`Handler`]. Any number of
//! callers may [`enqueue`](Connection::enqueue) onto a connection without
//! blocking.

mod cache;
pub use cache::ConnectionCache;

mod connection;
pub use connection::{Connection, Handler, SharedConnection, StreamError};

mod server;
pub use server::{connect, serve, DialError};
