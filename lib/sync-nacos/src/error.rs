//! Errors of the Nacos client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NacosError>;

#[derive(Error, Debug)]
pub enum NacosError {
    #[error("at least one Nacos server address is required")]
    NoServers,

    #[error("invalid Nacos server address: {0:?}")]
    InvalidServer(String),

    #[error("Nacos server port must be greater than zero")]
    InvalidPort,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("failed to encode instance payload: {0}")]
    Encode(#[from] serde_json::Error),
}
