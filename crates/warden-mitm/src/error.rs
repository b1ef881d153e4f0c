//! Error taxonomy for CA management, interception, and upstream relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate signing failed: {0}")]
    CryptoFailure(String),

    #[error("io error handling CA material: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("upstream dial failed: {0}")]
    UpstreamDial(#[from] reqwest::Error),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("malformed request: {0}")]
    ClientProtocol(String),
}
