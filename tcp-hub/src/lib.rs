//! TCP message-relay hub.
//!
//! Clients connect over plain TCP, are handed a numeric identity, can list
//! the other connected identities, and can relay opaque byte payloads to any
//! of them. The hub never looks inside a payload. Each module focuses on one
//! responsibility:
//!
//! - [`id`] allocates identities and parses comma separated id lists.
//! - [`registry`] tracks live connections behind a reader/writer lock.
//! - [`message`] is the newline framed wire protocol plus async read/write
//!   helpers for both directions.
//! - [`hub`] owns the listener, runs one task per connection, and dispatches
//!   commands against the registry.
//! - [`client`] is a protocol client and the single-shot CLI built on it.
//! - [`cli`] parses the command line for server and client modes.
//!
//! Unit tests live beside each module; `tests/` drives a real hub over TCP.

pub mod cli;
pub mod client;
pub mod hub;
pub mod id;
pub mod message;
pub mod registry;
