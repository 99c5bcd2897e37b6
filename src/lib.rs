//! # Connection Broker Library
//!
//! This library provides the core functionality for the connection broker
//! service: delegation-token validation, scope authorization, the connection
//! lifecycle state machine, and the access-issuance orchestration that ties
//! them together.

pub mod config;
pub mod db;
pub mod delegation;
pub mod error;
pub mod handlers;
pub mod issuance;
pub mod lifecycle;
pub mod models;
pub mod replay;
pub mod repositories;
pub mod scopes;
pub mod server;
pub mod telemetry;
pub mod vault;
pub use migration;
