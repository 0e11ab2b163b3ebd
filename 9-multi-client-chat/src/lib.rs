//! Multi-client TCP chat: one server relaying lines between terminal clients.
//!
//! The wire format is plain newline-delimited UTF-8, so `nc` works as a client
//! too. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] frames lines and renders the fixed server notices.
//! - [`registry`] tracks live sessions and fans broadcasts out to them.
//! - [`server`] accepts connections and runs the per-connection handshake,
//!   relay, and cleanup on its own task.
//! - [`client`] performs the handshake, then prints server lines while sending
//!   local input.
//!
//! Integration tests use this crate directly to exercise the server over real
//! sockets; the end-to-end test drives the compiled binary.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
