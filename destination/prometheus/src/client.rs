use crate::Error;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, warn};

/// Issues instant queries.
#[async_trait::async_trait]
pub trait QueryApi: Clone + Send + Sync + 'static {
    /// Evaluates a query at the current time. Results that are not instant
    /// vectors are errors.
    async fn query(&self, query: &str) -> Result<Vector, Error>;
}

pub type Vector = Vec<Sample>;

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub metric: BTreeMap<String, String>,
    pub value: f64,

    /// Seconds since the epoch.
    pub timestamp: f64,
}

/// Queries the Prometheus HTTP API.
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    query_url: reqwest::Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

// === impl Sample ===

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(String::as_str)
    }

    /// The sample's value rounded to an integer. `NaN` is zero.
    pub fn value_u64(&self) -> u64 {
        if self.value.is_nan() {
            return 0;
        }
        self.value.round() as u64
    }
}

// === impl Client ===

impl Client {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let query_url = format!("{}/api/v1/query", base_url.trim_end_matches('/'));
        let query_url = reqwest::Url::parse(&query_url)
            .map_err(|error| Error::invalid(format!("invalid Prometheus URL {base_url:?}: {error}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, query_url })
    }
}

#[async_trait::async_trait]
impl QueryApi for Client {
    async fn query(&self, query: &str) -> Result<Vector, Error> {
        debug!(%query, "Querying");
        let rsp = self
            .http
            .get(self.query_url.clone())
            .query(&[("query", query)])
            .send()
            .await?;
        // Prometheus describes failed queries in the response body.
        let status = rsp.status();
        let body = rsp.json::<QueryResponse>().await?;
        let result = decode(body);
        if let Err(error) = &result {
            warn!(%query, %status, %error, "Query failed");
        }
        result
    }
}

fn decode(rsp: QueryResponse) -> Result<Vector, Error> {
    if rsp.status != "success" {
        return Err(Error::Api {
            error_type: rsp.error_type.unwrap_or_default(),
            message: rsp.error.unwrap_or_default(),
        });
    }
    let data = rsp.data.ok_or_else(|| Error::Api {
        error_type: "bad_response".to_string(),
        message: "missing data".to_string(),
    })?;
    if data.result_type != "vector" {
        return Err(Error::UnexpectedResultType(data.result_type));
    }
    let samples = serde_json::from_value::<Vec<RawSample>>(data.result)?;
    Ok(samples
        .into_iter()
        .map(|RawSample { metric, value }| Sample {
            metric,
            timestamp: value.0,
            // Prometheus encodes special values as `NaN`, `+Inf`, and `-Inf`.
            value: match value.1.as_str() {
                "+Inf" => f64::INFINITY,
                "-Inf" => f64::NEG_INFINITY,
                v => v.parse().unwrap_or(f64::NAN),
            },
        })
        .collect())
}
