//! StatusHub Server - Centralized log and media hub.
//!
//! This crate provides the StatusHub server, responsible for:
//! - Collecting log messages and media blobs from many services
//! - Keeping bounded histories in memory
//! - Serving them to a password-protected dashboard
//! - Live tailing a service, or every service, over WebSockets
//!
//! # Architecture
//!
//! The [`store::EventStore`] is the single owner of all records. Writers
//! append through the HTTP API; streaming consumers register a one-shot
//! wake handle ([`broadcast`]) and pull what is new after every wake
//! ([`stream`]). Retention limits and the password live in durable
//! [`settings`]; process-level options come from the environment
//! ([`config`]).

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod settings;
pub mod store;
pub mod stream;
pub mod types;
