use std::path::PathBuf;

use thiserror::Error;

/// Service-core error taxonomy.
///
/// Every variant is fatal to the individual request and never to the service:
/// a failed establishment leaves no cache residue, so subsequent requests
/// retry from scratch.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("remote call failed: {0}")]
    Call(String),

    #[error("connection stack is empty")]
    EmptyStack,

    #[error("path is not registered with the file service: {0}")]
    Unregistered(PathBuf),

    #[error("{0} is not a regular file")]
    NotRegularFile(PathBuf),

    #[error("service is shutting down")]
    ServiceShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
