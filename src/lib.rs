//! zonedns: an embeddable DNS server engine.
//!
//! Queries arrive on a [`transport`], are routed through a chain of
//! [`plugin::Handler`]s chosen by [`router::Router`], and are answered from a
//! wildcard-aware [`trie::ZoneTrie`], a bounded [`plugin::cache::Cache`], or
//! upstream resolvers.

pub mod config;
pub mod error;
pub mod message;
pub mod plugin;
pub mod router;
pub mod server;
pub mod transport;
pub mod trie;
pub mod types;
pub mod wire;

pub use error::DnsError;
pub use message::{Completion, Connection, FinishedResponse, Request, Response, TransportKind};
pub use plugin::{Chain, Handler, Next};
pub use router::Router;
pub use server::{DefaultHandler, DnsServer};
pub use trie::ZoneTrie;
pub use types::{Message, Question, RData, Rcode, Record, RecordType};
