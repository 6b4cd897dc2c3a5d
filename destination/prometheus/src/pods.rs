//! Reports which pods run a proxy that is reporting metrics.

use crate::{Error, LabelSet, QueryApi, Resource, ResourceKind};
use serde::Deserialize;
use std::collections::HashMap;

/// Proxies report their start time; a pod is meshed if it appears in this
/// vector.
pub const MESHED_PODS_QUERY: &str = "max(process_start_time_seconds{labels}) by (pod, namespace)";

/// Filters a pod listing. A namespace and a resource are mutually exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListPodsRequest {
    pub namespace: Option<String>,

    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub resource_namespace: Option<String>,
    pub resource_name: Option<String>,
}

/// Maps `(namespace, pod)` to the time, in seconds since the epoch, at which
/// the pod's proxy last reported.
pub type MeshedPods = HashMap<(String, String), f64>;

// === impl ListPodsRequest ===

impl ListPodsRequest {
    /// Validates the request, returning the resource that pods must belong to,
    /// if any.
    pub fn validate(&self) -> Result<Option<Resource>, Error> {
        let namespace = self.namespace.as_deref().filter(|ns| !ns.is_empty());
        let resource_type = self.resource_type.as_deref().filter(|t| !t.is_empty());
        let kind = match resource_type {
            None => return Ok(None),
            Some(_) if namespace.is_some() => {
                return Err(Error::invalid(
                    "cannot set both namespace and resource in the request. These are mutually exclusive",
                ))
            }
            Some(t) => t.parse::<ResourceKind>()?,
        };
        if matches!(
            kind,
            ResourceKind::Authority | ResourceKind::Service | ResourceKind::ServiceProfile
        ) {
            return Err(Error::invalid(format!("cannot list pods of a {kind}")));
        }
        Ok(Some(Resource::new(
            kind,
            self.resource_namespace.as_deref().unwrap_or_default(),
            self.resource_name.as_deref().unwrap_or_default(),
        )))
    }
}

/// Queries for the pods whose proxies are reporting, optionally restricted to a
/// namespace.
pub async fn meshed_pods<A: QueryApi>(api: &A, namespace: Option<&str>) -> Result<MeshedPods, Error> {
    let mut labels = LabelSet::default();
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        labels.insert("namespace", ns);
    }
    let query = MESHED_PODS_QUERY.replace("{labels}", &labels.to_string());
    let vector = api.query(&query).await?;
    Ok(vector
        .into_iter()
        .filter_map(|sample| {
            let ns = sample.label("namespace")?.to_string();
            let pod = sample.label("pod")?.to_string();
            Some(((ns, pod), sample.timestamp))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sample, Vector};
    use maplit::btreemap;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct MockApi(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl QueryApi for MockApi {
        async fn query(&self, query: &str) -> Result<Vector, Error> {
            self.0.lock().push(query.to_string());
            Ok(vec![
                Sample {
                    metric: btreemap! {
                        "namespace".to_string() => "emojivoto".to_string(),
                        "pod".to_string() => "emojivoto-meshed".to_string(),
                    },
                    value: 1.5e9,
                    timestamp: 456.0,
                },
                Sample {
                    metric: btreemap! { "pod".to_string() => "no-namespace".to_string() },
                    value: 1.5e9,
                    timestamp: 456.0,
                },
            ])
        }
    }

    #[tokio::test]
    async fn finds_reporting_pods() {
        let api = MockApi::default();
        let pods = meshed_pods(&api, Some("emojivoto")).await.unwrap();
        assert_eq!(
            pods,
            [(("emojivoto".to_string(), "emojivoto-meshed".to_string()), 456.0)]
                .into_iter()
                .collect::<MeshedPods>()
        );
        assert_eq!(
            *api.0.lock(),
            vec![r#"max(process_start_time_seconds{namespace="emojivoto"}) by (pod, namespace)"#]
        );
    }

    #[test]
    fn validates_requests() {
        assert_eq!(ListPodsRequest::default().validate().unwrap(), None);

        let err = ListPodsRequest {
            namespace: Some("emojivoto".to_string()),
            resource_type: Some("deploy".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot set both namespace and resource in the request. These are mutually exclusive"
        );

        let resource = ListPodsRequest {
            resource_type: Some("deploy".to_string()),
            resource_name: Some("meshed-deployment".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(
            resource,
            Some(Resource::new(ResourceKind::Deployment, "", "meshed-deployment"))
        );

        assert!(ListPodsRequest {
            resource_type: Some("svc".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap_err()
        .is_invalid());
    }
}
