use crate::{Error, LabelNames, LabelSet, QueryApi, Vector};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};
use tokio::task::JoinSet;
use tracing::{debug_span, warn, Instrument};

pub const REQUESTS: &str = "QUERY_REQUESTS";

/// Identifies the result of one query in an aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
    Request(String),
    Latency(Quantile),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantile {
    P50,
    P95,
    P99,
}

pub const QUANTILES: [Quantile; 3] = [Quantile::P50, Quantile::P95, Quantile::P99];

/// Issues one query per request template and one latency query per quantile,
/// concurrently, and waits for all of them.
///
/// Templates may reference `{labels}`, `{window}`, and `{group_by}`; the
/// latency template may also reference `{quantile}`. If any query fails, the
/// first failure is returned once every query has completed. Dropping the
/// returned future aborts all outstanding queries.
pub async fn aggregate<A: QueryApi>(
    api: &A,
    request_templates: &BTreeMap<String, String>,
    latency_template: &str,
    labels: &LabelSet,
    window: &str,
    group_by: &LabelNames,
) -> Result<HashMap<QueryKind, Vector>, Error> {
    let labels = labels.to_string();
    let group_by = group_by.to_string();

    let mut queries = JoinSet::new();
    let mut spawn = |kind: QueryKind, query: String| {
        let api = api.clone();
        let span = debug_span!("query", ?kind);
        queries.spawn(
            async move {
                let result = api.query(&query).await;
                (kind, result)
            }
            .instrument(span),
        );
    };
    for (kind, template) in request_templates {
        let query = render(template, &labels, window, &group_by, None);
        spawn(QueryKind::Request(kind.clone()), query);
    }
    for quantile in QUANTILES {
        let query = render(latency_template, &labels, window, &group_by, Some(quantile));
        spawn(QueryKind::Latency(quantile), query);
    }

    let mut results = HashMap::with_capacity(queries.len());
    let mut failure = None;
    while let Some(joined) = queries.join_next().await {
        match joined {
            Ok((kind, Ok(vector))) => {
                results.insert(kind, vector);
            }
            Ok((kind, Err(error))) => {
                warn!(?kind, %error, "Query failed");
                failure.get_or_insert(error);
            }
            Err(error) => {
                failure.get_or_insert(error.into());
            }
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(results),
    }
}

/// Substitutes placeholders in a single pass, so substituted values are never
/// themselves expanded. Unknown placeholders are left as-is.
fn render(
    template: &str,
    labels: &str,
    window: &str,
    group_by: &str,
    quantile: Option<Quantile>,
) -> String {
    let mut query = String::with_capacity(template.len() + labels.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        query.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail.find('}').and_then(|close| {
            let value = match &tail[1..close] {
                "labels" => labels,
                "window" => window,
                "group_by" => group_by,
                "quantile" => quantile?.as_str(),
                _ => return None,
            };
            Some((value, close))
        });
        match value {
            Some((value, close)) => {
                query.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                query.push('{');
                rest = &tail[1..];
            }
        }
    }
    query.push_str(rest);
    query
}

// === impl Quantile ===

impl Quantile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P50 => "0.5",
            Self::P95 => "0.95",
            Self::P99 => "0.99",
        }
    }
}

impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{labels, Resource, ResourceKind, Sample};
    use maplit::btreemap;
    use parking_lot::Mutex;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::time;

    /// Answers each query after a delay; queries containing `fail` fail.
    #[derive(Clone, Default)]
    struct MockApi {
        queries: Arc<Mutex<Vec<String>>>,
        started: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    struct Track(Arc<AtomicUsize>);

    impl Drop for Track {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl QueryApi for MockApi {
        async fn query(&self, query: &str) -> Result<Vector, Error> {
            let _track = Track(self.dropped.clone());
            self.queries.lock().push(query.to_string());
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            match self.delay {
                Some(delay) => time::sleep(delay * (n as u32 + 1)).await,
                None => std::future::pending().await,
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            if query.contains("fail") {
                return Err(Error::UnexpectedResultType("matrix".to_string()));
            }
            Ok(vec![Sample {
                metric: Default::default(),
                value: 1.0,
                timestamp: 0.0,
            }])
        }
    }

    fn templates(n: usize, failing: Option<usize>) -> BTreeMap<String, String> {
        (0..n)
            .map(|i| {
                let metric = if Some(i) == failing { "fail" } else { "ok" };
                (
                    format!("Q{i}"),
                    format!("sum(increase({metric}_total{{labels}}[{{window}}])) by ({{group_by}})"),
                )
            })
            .collect()
    }

    const LATENCY: &str =
        "histogram_quantile({quantile}, sum(irate(latency_bucket{labels}[{window}])) by (le, {group_by}))";

    #[test]
    fn renders_placeholders_once() {
        let labels = r#"{deployment="{window}"}"#;
        assert_eq!(
            render(
                "sum(rate(response_total{labels}[{window}])) by ({group_by})",
                labels,
                "1m",
                "namespace",
                None,
            ),
            r#"sum(rate(response_total{deployment="{window}"}[1m])) by (namespace)"#
        );
        assert_eq!(
            render("q({quantile}, x{labels}{unknown}", "{a=\"b\"}", "", "", Some(Quantile::P95)),
            r#"q(0.95, x{a="b"}{unknown}"#
        );
        assert_eq!(render("{quantile}", "", "", "", None), "{quantile}");
    }

    #[tokio::test(start_paused = true)]
    async fn returns_one_result_per_query() {
        let api = MockApi {
            delay: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let resource = Resource::new(ResourceKind::Deployment, "emojivoto", "web");
        let results = aggregate(
            &api,
            &templates(2, None),
            LATENCY,
            &labels::query_labels(Some(&resource)),
            "1m",
            &labels::group_by_labels(ResourceKind::Deployment),
        )
        .await
        .unwrap();

        let mut kinds = results.keys().cloned().collect::<Vec<_>>();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                QueryKind::Request("Q0".to_string()),
                QueryKind::Request("Q1".to_string()),
                QueryKind::Latency(Quantile::P50),
                QueryKind::Latency(Quantile::P95),
                QueryKind::Latency(Quantile::P99),
            ]
        );

        let mut queries = api.queries.lock().clone();
        queries.sort();
        assert_eq!(
            queries,
            vec![
                r#"histogram_quantile(0.5, sum(irate(latency_bucket{deployment="web", namespace="emojivoto"}[1m])) by (le, namespace, deployment))"#,
                r#"histogram_quantile(0.95, sum(irate(latency_bucket{deployment="web", namespace="emojivoto"}[1m])) by (le, namespace, deployment))"#,
                r#"histogram_quantile(0.99, sum(irate(latency_bucket{deployment="web", namespace="emojivoto"}[1m])) by (le, namespace, deployment))"#,
                r#"sum(increase(ok_total{deployment="web", namespace="emojivoto"}[1m])) by (namespace, deployment)"#,
                r#"sum(increase(ok_total{deployment="web", namespace="emojivoto"}[1m])) by (namespace, deployment)"#,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_every_query_when_one_fails() {
        let api = MockApi {
            delay: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let err = aggregate(
            &api,
            &templates(4, Some(0)),
            LATENCY,
            &LabelSet::default(),
            "10s",
            &labels::group_by_labels(ResourceKind::Pod),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::UnexpectedResultType(_)), "{err}");
        assert_eq!(api.started.load(Ordering::SeqCst), 7);
        assert_eq!(api.completed.load(Ordering::SeqCst), 7);
        assert_eq!(api.dropped.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_outstanding_queries() {
        let api = MockApi::default();
        let request_templates = btreemap! {
            REQUESTS.to_string() => "requests{labels}".to_string(),
            "QUERY_ACTUAL_REQUESTS".to_string() => "actual_requests{labels}".to_string(),
        };
        let res = time::timeout(
            Duration::from_secs(1),
            aggregate(
                &api,
                &request_templates,
                LATENCY,
                &LabelSet::default(),
                "1m",
                &LabelNames::default(),
            ),
        )
        .await;
        assert!(res.is_err(), "queries never complete");

        // Aborted tasks drop their queries once the runtime processes them.
        time::timeout(Duration::from_secs(1), async {
            while api.dropped.load(Ordering::SeqCst) < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("all queries must be dropped");
        assert_eq!(api.started.load(Ordering::SeqCst), 5);
        assert_eq!(api.completed.load(Ordering::SeqCst), 0);
    }
}
