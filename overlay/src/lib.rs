//! A registry and overlay nodes that build a ring-structured overlay over TCP
//! and measure the traffic routed across it.
//!
//! See [`overlay_core`] for the wire format, transport, and routing rules these
//! applications are built on.

pub mod applications;
pub mod cli;
pub mod config;
pub mod console;
