//! Queries Prometheus for the traffic metrics reported by proxies.
//!
//! Every summary is computed from a fixed set of instant queries that are
//! issued concurrently and joined into a single result or a single error.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod client;
pub mod labels;
pub mod pods;
mod resource;
pub mod stat;

pub use self::{
    aggregate::{aggregate, QueryKind, Quantile, QUANTILES, REQUESTS},
    client::{Client, QueryApi, Sample, Vector},
    labels::{LabelNames, LabelSet},
    resource::{Resource, ResourceKind, STAT_ALL_RESOURCE_KINDS},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was rejected before any query was issued.
    #[error("{0}")]
    Invalid(String),

    #[error("query failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query failed: {error_type}: {message}")]
    Api { error_type: String, message: String },

    #[error("Unexpected query result type (expected Vector): {0}")]
    UnexpectedResultType(String),

    #[error("failed to decode query result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn invalid(msg: impl ToString) -> Self {
        Self::Invalid(msg.to_string())
    }

    /// Indicates whether the error describes a malformed request rather than
    /// a failure to query the backend.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}
