//! Registry error types

use arbok_overlay::OverlayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The overlay address pool has no free addresses
    #[error("address pool exhausted")]
    PoolExhausted,

    /// Subdomain generation kept colliding with live records
    #[error("could not generate a unique subdomain after {0} attempts")]
    NameCollision(usize),

    /// No live record with the given id
    #[error("tunnel not found: {0}")]
    NotFound(String),

    /// Overlay device or pool failure
    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
