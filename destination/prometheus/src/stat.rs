//! Summarizes traffic by resource.

use crate::{
    aggregate,
    labels::{direction_labels, dst_query_labels, group_by_labels, query_labels},
    pods::{meshed_pods, MeshedPods},
    Error, QueryApi, QueryKind, Quantile, Resource, ResourceKind, Vector, REQUESTS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const REQUEST_QUERY: &str =
    "sum(increase(response_total{labels}[{window}])) by ({group_by}, classification, tls)";

pub const LATENCY_QUANTILE_QUERY: &str =
    "histogram_quantile({quantile}, sum(irate(response_latency_ms_bucket{labels}[{window}])) by (le, {group_by}))";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatRequest {
    /// A resource kind, or `all`.
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub namespace: String,
    pub all_namespaces: bool,
    pub window: String,

    /// Summarizes outbound traffic to a resource rather than inbound traffic.
    pub to_type: Option<String>,
    pub to_name: String,
    pub to_namespace: String,
}

/// A pod and its top-level owner, used to count meshed pods per resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodOwner {
    pub namespace: String,
    pub name: String,
    pub owner_kind: String,
    pub owner_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatSummary {
    pub batches: Vec<StatBatch>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatBatch {
    pub kind: ResourceKind,
    pub rows: Vec<StatRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatRow {
    pub namespace: String,
    pub name: String,
    pub meshed: bool,
    pub meshed_pod_count: u64,
    pub total_pod_count: u64,

    /// Absent when no traffic was reported.
    pub stats: Option<BasicStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub tls_request_count: u64,
    pub latency_ms_p50: u64,
    pub latency_ms_p95: u64,
    pub latency_ms_p99: u64,
}

/// A validated request.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Query {
    kinds: Vec<ResourceKind>,
    namespace: String,
    name: String,
    window: String,
    to: Option<Resource>,
}

// === impl StatRequest ===

impl Default for StatRequest {
    fn default() -> Self {
        Self {
            resource_type: String::new(),
            name: String::new(),
            namespace: String::new(),
            all_namespaces: false,
            window: "1m".to_string(),
            to_type: None,
            to_name: String::new(),
            to_namespace: String::new(),
        }
    }
}

impl StatRequest {
    fn validate(&self) -> Result<Query, Error> {
        let kinds = ResourceKind::parse_many(&self.resource_type)?;
        if self.all_namespaces && !self.namespace.is_empty() {
            return Err(Error::invalid(
                "cannot set both namespace and all_namespaces in the request",
            ));
        }
        if kinds.len() > 1 && !self.name.is_empty() {
            return Err(Error::invalid("a resource name may not be set for type all"));
        }
        validate_window(&self.window)?;

        let to = match self.to_type.as_deref().filter(|t| !t.is_empty()) {
            None => None,
            Some("all") => return Err(Error::invalid("'to' resource type may not be all")),
            Some(t) => Some(Resource::new(t.parse()?, &self.to_namespace, &self.to_name)),
        };

        Ok(Query {
            kinds,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            window: self.window.clone(),
            to,
        })
    }
}

/// Windows are Prometheus durations with a single unit, e.g. `10s` or `1m`.
fn validate_window(window: &str) -> Result<(), Error> {
    let unit_at = window
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(window.len());
    let (n, unit) = window.split_at(unit_at);
    let valid_unit = matches!(unit, "ms" | "s" | "m" | "h" | "d" | "w" | "y");
    if n.is_empty() || !valid_unit || n.chars().all(|c| c == '0') {
        return Err(Error::invalid(format!("invalid time window: {window:?}")));
    }
    Ok(())
}

/// Summarizes traffic for each requested resource kind, in order.
///
/// Requests are validated before any query is issued.
pub async fn stat_summary<A: QueryApi>(
    api: &A,
    req: &StatRequest,
    pods: &[PodOwner],
) -> Result<StatSummary, Error> {
    let query = req.validate()?;
    let meshed = meshed_pods(api, Some(query.namespace.as_str())).await?;
    let request_templates = BTreeMap::from([(REQUESTS.to_string(), REQUEST_QUERY.to_string())]);

    let mut summary = StatSummary::default();
    for kind in query.kinds.iter().copied() {
        let resource = match kind {
            // Namespaces are named by the request's namespace.
            ResourceKind::Namespace if query.name.is_empty() => {
                Resource::new(kind, "", &query.namespace)
            }
            _ => Resource::new(kind, &query.namespace, &query.name),
        };
        let labels = match &query.to {
            None => query_labels(Some(&resource)).merge(direction_labels("inbound")),
            Some(to) => query_labels(Some(&resource))
                .merge(dst_query_labels(to))
                .merge(direction_labels("outbound")),
        };
        let results = aggregate(
            api,
            &request_templates,
            LATENCY_QUANTILE_QUERY,
            &labels,
            &query.window,
            &group_by_labels(kind),
        )
        .await?;

        let mut rows = pod_rows(&resource, pods, &meshed);
        add_stats(kind, &mut rows, &results);
        let mut rows = rows
            .into_iter()
            .map(|((namespace, name), mut row)| {
                row.namespace = namespace;
                row.name = name;
                row
            })
            .collect::<Vec<_>>();

        if matches!(kind, ResourceKind::Service | ResourceKind::Authority) {
            let previous = summary.batches.last().map_or(&[][..], |b| b.rows.as_slice());
            let status = inferred_mesh_status(previous);
            for row in &mut rows {
                row.meshed = status;
            }
        }

        summary.batches.push(StatBatch { kind, rows });
    }
    Ok(summary)
}

/// Infers the mesh status of services and authorities, which are not backed by
/// pods in this summary.
///
/// The status is taken from the first row of the batch summarized just before:
/// a service is reported as meshed when that row is meshed. Rows are not
/// matched to the service, so the result depends on the order in which kinds
/// are summarized and on the order of the previous batch's rows.
pub fn inferred_mesh_status(previous: &[StatRow]) -> bool {
    previous.first().map_or(false, |row| row.meshed)
}

type Rows = BTreeMap<(String, String), StatRow>;

fn empty_row() -> StatRow {
    StatRow {
        namespace: String::new(),
        name: String::new(),
        meshed: false,
        meshed_pod_count: 0,
        total_pod_count: 0,
        stats: None,
    }
}

/// Counts the pods, and meshed pods, that belong to each selected resource.
fn pod_rows(resource: &Resource, pods: &[PodOwner], meshed: &MeshedPods) -> Rows {
    let mut rows = Rows::new();
    for pod in pods {
        if !resource.selects_pod(&pod.namespace, &pod.name, &pod.owner_kind, &pod.owner_name) {
            continue;
        }
        let key = match resource.kind {
            ResourceKind::Namespace => (pod.namespace.clone(), pod.namespace.clone()),
            ResourceKind::Pod => (pod.namespace.clone(), pod.name.clone()),
            _ => (pod.namespace.clone(), pod.owner_name.clone()),
        };
        let row = rows.entry(key).or_insert_with(empty_row);
        row.total_pod_count += 1;
        if meshed.contains_key(&(pod.namespace.clone(), pod.name.clone())) {
            row.meshed_pod_count += 1;
            row.meshed = true;
        }
    }
    rows
}

/// Adds request counts and latencies to the rows identified by each sample.
fn add_stats(kind: ResourceKind, rows: &mut Rows, results: &HashMap<QueryKind, Vector>) {
    let row_key = |sample: &crate::Sample| -> Option<(String, String)> {
        let ns = sample.label("namespace")?.to_string();
        let name = match kind {
            ResourceKind::Namespace => ns.clone(),
            kind => sample.label(kind.label())?.to_string(),
        };
        Some((ns, name))
    };

    for (query, vector) in results {
        for sample in vector {
            let Some(key) = row_key(sample) else { continue };
            let stats = rows
                .entry(key)
                .or_insert_with(empty_row)
                .stats
                .get_or_insert_with(BasicStats::default);
            let value = sample.value_u64();
            match query {
                QueryKind::Request(_) => {
                    match sample.label("classification") {
                        Some("success") => stats.success_count += value,
                        Some("failure") => stats.failure_count += value,
                        _ => {}
                    }
                    if sample.label("tls") == Some("true") {
                        stats.tls_request_count += value;
                    }
                }
                QueryKind::Latency(Quantile::P50) => stats.latency_ms_p50 = value,
                QueryKind::Latency(Quantile::P95) => stats.latency_ms_p95 = value,
                QueryKind::Latency(Quantile::P99) => stats.latency_ms_p99 = value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;
    use maplit::btreemap;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Serves canned vectors by matching a query's metric name.
    #[derive(Clone, Default)]
    struct MockApi {
        queries: Arc<Mutex<Vec<String>>>,
    }

    fn sample(labels: BTreeMap<&str, &str>, value: f64) -> Sample {
        Sample {
            metric: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
            timestamp: 0.0,
        }
    }

    #[async_trait::async_trait]
    impl QueryApi for MockApi {
        async fn query(&self, query: &str) -> Result<Vector, Error> {
            self.queries.lock().push(query.to_string());
            if query.contains("process_start_time_seconds") {
                return Ok(vec![sample(
                    btreemap! { "namespace" => "emojivoto", "pod" => "web-abc" },
                    1.0,
                )]);
            }
            if !query.contains("deployment") {
                return Ok(vec![]);
            }
            if query.contains("response_total") {
                return Ok(vec![
                    sample(
                        btreemap! {
                            "namespace" => "emojivoto", "deployment" => "web",
                            "classification" => "success", "tls" => "true",
                        },
                        9.6,
                    ),
                    sample(
                        btreemap! {
                            "namespace" => "emojivoto", "deployment" => "web",
                            "classification" => "failure", "tls" => "false",
                        },
                        2.0,
                    ),
                ]);
            }
            let latency = if query.contains("0.5,") {
                5.0
            } else if query.contains("0.95,") {
                f64::NAN
            } else {
                20.0
            };
            Ok(vec![sample(
                btreemap! { "namespace" => "emojivoto", "deployment" => "web" },
                latency,
            )])
        }
    }

    fn pods() -> Vec<PodOwner> {
        let pod = |name: &str, owner_kind: &str, owner_name: &str| PodOwner {
            namespace: "emojivoto".to_string(),
            name: name.to_string(),
            owner_kind: owner_kind.to_string(),
            owner_name: owner_name.to_string(),
        };
        vec![
            pod("web-abc", "deployment", "web"),
            pod("web-def", "deployment", "web"),
            pod("voting-abc", "deployment", "voting"),
            pod("vote-bot", "pod", "vote-bot"),
        ]
    }

    #[tokio::test]
    async fn summarizes_deployments() {
        let api = MockApi::default();
        let req = StatRequest {
            resource_type: "deploy".to_string(),
            namespace: "emojivoto".to_string(),
            ..Default::default()
        };
        let summary = stat_summary(&api, &req, &pods()).await.unwrap();

        assert_eq!(summary.batches.len(), 1);
        let batch = &summary.batches[0];
        assert_eq!(batch.kind, ResourceKind::Deployment);
        assert_eq!(
            batch.rows,
            vec![
                StatRow {
                    namespace: "emojivoto".to_string(),
                    name: "voting".to_string(),
                    meshed: false,
                    meshed_pod_count: 0,
                    total_pod_count: 1,
                    stats: None,
                },
                StatRow {
                    namespace: "emojivoto".to_string(),
                    name: "web".to_string(),
                    meshed: true,
                    meshed_pod_count: 1,
                    total_pod_count: 2,
                    stats: Some(BasicStats {
                        success_count: 10,
                        failure_count: 2,
                        tls_request_count: 10,
                        latency_ms_p50: 5,
                        latency_ms_p95: 0,
                        latency_ms_p99: 20,
                    }),
                },
            ]
        );

        let queries = api.queries.lock();
        assert!(queries.contains(
            &r#"sum(increase(response_total{direction="inbound", namespace="emojivoto"}[1m])) by (namespace, deployment, classification, tls)"#
                .to_string()
        ), "{queries:#?}");
    }

    #[tokio::test]
    async fn services_inherit_the_previous_batch_status() {
        let api = MockApi::default();
        let req = StatRequest {
            resource_type: "all".to_string(),
            namespace: "emojivoto".to_string(),
            ..Default::default()
        };
        let summary = stat_summary(&api, &req, &pods()).await.unwrap();
        let kinds = summary.batches.iter().map(|b| b.kind).collect::<Vec<_>>();
        assert_eq!(kinds, crate::STAT_ALL_RESOURCE_KINDS.to_vec());

        // The pod batch, which precedes services, starts with an unmeshed pod.
        let pods = &summary.batches[4];
        assert_eq!(pods.kind, ResourceKind::Pod);
        assert_eq!(pods.rows[0].name, "vote-bot");
        assert!(!pods.rows[0].meshed);
        assert!(!inferred_mesh_status(&pods.rows));
        assert!(inferred_mesh_status(&pods.rows[2..]));
        assert!(!inferred_mesh_status(&[]));
    }

    #[tokio::test]
    async fn rejects_invalid_requests_without_querying() {
        let api = MockApi::default();
        for req in [
            StatRequest {
                resource_type: "deploymnt".to_string(),
                ..Default::default()
            },
            StatRequest {
                resource_type: "deploy".to_string(),
                namespace: "emojivoto".to_string(),
                all_namespaces: true,
                ..Default::default()
            },
            StatRequest {
                resource_type: "deploy".to_string(),
                window: "1 minute".to_string(),
                ..Default::default()
            },
            StatRequest {
                resource_type: "deploy".to_string(),
                to_type: Some("all".to_string()),
                ..Default::default()
            },
            StatRequest {
                resource_type: "all".to_string(),
                name: "web".to_string(),
                ..Default::default()
            },
        ] {
            let err = stat_summary(&api, &req, &[]).await.unwrap_err();
            assert!(err.is_invalid(), "{req:?}: {err}");
        }
        assert!(api.queries.lock().is_empty());
    }

    #[test]
    fn validates_windows() {
        for window in ["10s", "1m", "500ms", "2h", "1d"] {
            assert!(validate_window(window).is_ok(), "{window}");
        }
        for window in ["", "m", "0s", "1.5m", "10", "1M"] {
            assert!(validate_window(window).is_err(), "{window}");
        }
    }
}
