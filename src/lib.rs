//! Line-oriented TCP chat with a single broadcast hub.
//!
//! Clients connect, answer a username prompt, and from then on every line
//! they send is fanned out to all connected participants, including
//! themselves. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the listen address and hub tuning flags.
//! - [`hub`] runs the one event loop that owns the membership table and
//!   fans messages out into per-participant delivery queues.
//! - [`session`] speaks the newline-delimited protocol on one accepted
//!   connection, relaying between the socket and the hub.
//! - [`server`] accepts TCP connections and hands each one to a session.
//! - [`message`] holds the participant and message records plus the line
//!   read/write helpers.
//!
//! Integration tests use this crate directly to drive the hub and the
//! full server over real sockets.

pub mod cli;
pub mod hub;
pub mod message;
pub mod server;
pub mod session;
