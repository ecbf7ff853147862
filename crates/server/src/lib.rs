//! Whisper Server Library
//!
//! This crate provides the directory server that registers clients, hands
//! out uids and answers signed public key lookups.

pub mod config;
pub mod handler;
pub mod server;

pub use config::{Config, ConfigError};
pub use handler::{HandlerError, RequestHandler};
pub use server::Server;
