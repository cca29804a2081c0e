// Sparse clockwork hierarchy - error types for construction, stepping and persistence

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A descriptor set cannot describe a valid layer or hierarchy.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A code or input set handed to a running hierarchy has the wrong shape.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A saved stream is not a hierarchy file, or its sizes are inconsistent.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
