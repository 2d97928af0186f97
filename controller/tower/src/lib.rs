//! A client for the Tower virtualization platform.
//!
//! Tower exposes a GraphQL API at `https://<addr>/api`. NIC snapshots are
//! queried over HTTPS and change notifications are pushed over a GraphQL
//! subscription at `wss://<addr>/api/ws`. Change notifications only carry the
//! changed resource's id, so consumers must query for the resource's state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod feed;
mod graphql;

pub use self::{
    client::{Client, Credentials},
    feed::ChangeFeed,
    graphql::{ResponseError, ResponseErrors},
};

/// The resource type Tower uses for VM NICs in change notifications.
pub const VM_NIC_RESOURCE_TYPE: &str = "VmNic";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query failed: {0}")]
    Query(ResponseErrors),

    #[error("response data is missing `{0}`")]
    MissingObject(&'static str),

    #[error("failed to decode `{object}`: {source}")]
    Decode {
        object: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("login did not return a token")]
    MissingToken,

    #[error("websocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("change feed closed: {0}")]
    FeedClosed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
