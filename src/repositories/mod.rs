//! # Repositories
//!
//! Database access layer. Every lifecycle transition runs as a single
//! transaction so concurrent transitions on the same connection serialize.

pub mod connection;

pub use connection::{ActivationEvent, ConnectionRepository, NewConnection};
