//! Arbok core — shared configuration and error types.
//!
//! Everything the server binary needs to bootstrap lives here: the TOML
//! configuration model with environment-variable overlay, duration string
//! parsing, and the configuration error type.

pub mod config;
pub mod error;
pub mod humantime;

pub use config::Config;
pub use error::ConfigError;
