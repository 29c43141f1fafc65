//! IRC bot that keeps a persistent karma score for every handle it hears about.
//!
//! The bot connects to a server, registers a nickname, joins one channel and
//! watches the chat for `handle++` / `handle--` as well as a handful of
//! commands addressed to it by name. Each module focuses on a concrete
//! responsibility:
//!
//! - [`cli`] parses the command-line interface of the binary.
//! - [`config`] loads and validates the immutable [`SessionConfig`].
//! - [`store`] holds the karma ledger and persists it to a JSON file after
//!   every mutation.
//! - [`protocol`] classifies raw IRC lines and encodes outbound frames.
//! - [`transport`] owns the connection, frames the byte stream into lines and
//!   answers keep-alive probes as soon as they arrive.
//! - [`router`] turns received lines into [`ChatMessage`]s on a bounded queue.
//! - [`dispatch`] interprets chat messages and replies through the transport.
//! - [`session`] wires everything together and performs graceful shutdown.
//!
//! Integration tests drive a full session against a fake server through
//! `tokio::io::duplex` and a local TCP listener.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use protocol::ChatMessage;
pub use store::{KarmaEntry, KarmaStore};

/// Version reported by the `version` command and the `-v` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
