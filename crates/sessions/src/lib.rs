//! Session message logs.
//!
//! Each session key owns an append-only log of exchanged messages, kept in
//! memory for the lifetime of the process.

pub mod store;

pub use store::{ChatMessage, Role, SessionEntry, SessionStore};
