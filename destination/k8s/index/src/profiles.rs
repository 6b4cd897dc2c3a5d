//! Resolves ServiceProfile resources into per-service profiles.

use crate::{
    listeners::{ProfileEvent, Registry},
    ClusterInfo,
};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use linkerd_destination_core::{
    profile::Method, Profile, RequestMatch, ResponseClass, ResponseMatch, RetryBudget, RouteSpec,
    ServiceRef,
};
use linkerd_destination_k8s_api::{duration, profile as api};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct ProfileIndex {
    /// Converted profiles by namespace and resource name.
    profiles: HashMap<(String, String), Arc<Profile>>,

    /// Services that have listeners.
    services: HashMap<ServiceRef, ServiceProfile>,
}

#[derive(Debug)]
pub(crate) struct ServiceProfile {
    current: Option<Arc<Profile>>,
    pub(crate) listeners: Registry<ProfileEvent>,
}

// === impl ProfileIndex ===

impl ProfileIndex {
    pub(crate) fn apply(
        &mut self,
        ns: String,
        name: String,
        spec: api::ServiceProfileSpec,
        cluster: &ClusterInfo,
    ) {
        let profile = Arc::new(convert(&ns, &name, spec));
        self.profiles.insert((ns.clone(), name.clone()), profile);
        self.reindex(&ns, &name, cluster);
    }

    pub(crate) fn delete(&mut self, ns: String, name: String, cluster: &ClusterInfo) {
        if self.profiles.remove(&(ns.clone(), name.clone())).is_some() {
            self.reindex(&ns, &name, cluster);
        }
    }

    /// Returns the profile state of a service, resolving it on first use.
    pub(crate) fn service_or_default(
        &mut self,
        service: ServiceRef,
        cluster: &ClusterInfo,
    ) -> &mut ServiceProfile {
        let current = self.lookup(&service, cluster);
        self.services
            .entry(service)
            .or_insert_with(|| ServiceProfile {
                current,
                listeners: Registry::new(cluster.listener_queue_capacity),
            })
    }

    pub(crate) fn listeners(&self) -> usize {
        self.services.values().map(|s| s.listeners.len()).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Drops services that no longer have listeners.
    pub(crate) fn gc(&mut self) {
        self.services.retain(|_, s| !s.listeners.is_empty());
    }

    /// Finds the profile that applies to a service: a profile in the service's
    /// namespace takes precedence over one in the control plane namespace.
    pub(crate) fn lookup(
        &self,
        service: &ServiceRef,
        cluster: &ClusterInfo,
    ) -> Option<Arc<Profile>> {
        let name = cluster.profile_name(&service.namespace, &service.name);
        self.profiles
            .get(&(service.namespace.clone(), name.clone()))
            .or_else(|| {
                self.profiles
                    .get(&(cluster.control_plane_ns.clone(), name))
            })
            .cloned()
    }

    /// Re-resolves every subscribed service that a profile resource may apply
    /// to, notifying listeners of changes.
    fn reindex(&mut self, ns: &str, name: &str, cluster: &ClusterInfo) {
        let affected = self
            .services
            .keys()
            .filter(|svc| {
                (svc.namespace == ns || ns == cluster.control_plane_ns)
                    && cluster.profile_name(&svc.namespace, &svc.name) == name
            })
            .cloned()
            .collect::<Vec<_>>();
        for svc in affected {
            let profile = self.lookup(&svc, cluster);
            if let Some(state) = self.services.get_mut(&svc) {
                if state.current != profile {
                    debug!(service = %svc, "Updating profile");
                    state.current = profile.clone();
                    state.listeners.notify(&profile);
                }
            }
        }
    }
}

// === impl ServiceProfile ===

impl ServiceProfile {
    pub(crate) fn initial_events(&self) -> Vec<ProfileEvent> {
        vec![self.current.clone()]
    }
}

/// Converts a ServiceProfile spec, skipping routes that cannot be used.
pub(crate) fn convert(ns: &str, name: &str, spec: api::ServiceProfileSpec) -> Profile {
    let routes = spec
        .routes
        .into_iter()
        .filter_map(|route| {
            let route_name = route.name.clone();
            match convert_route(route) {
                Ok(route) => Some(route),
                Err(error) => {
                    warn!(%ns, profile = %name, route = %route_name, %error, "Ignoring invalid route");
                    None
                }
            }
        })
        .collect();

    let retry_budget = spec.retry_budget.and_then(|budget| {
        match duration::parse(&budget.ttl) {
            Ok(ttl) => Some(RetryBudget {
                retry_ratio: budget.retry_ratio,
                min_retries_per_second: budget.min_retries_per_second,
                ttl,
            }),
            Err(error) => {
                warn!(%ns, profile = %name, %error, "Ignoring invalid retry budget");
                None
            }
        }
    });

    Profile {
        routes,
        retry_budget,
    }
}

fn convert_route(route: api::RouteSpec) -> Result<RouteSpec> {
    let condition = request_match(route.condition)?;
    let response_classes = route
        .response_classes
        .into_iter()
        .map(|rc| {
            Ok(ResponseClass {
                condition: response_match(rc.condition)?,
                is_failure: rc.is_failure,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let timeout = route
        .timeout
        .as_deref()
        .map(duration::parse)
        .transpose()
        .context("invalid timeout")?;
    Ok(RouteSpec {
        name: route.name,
        condition,
        response_classes,
        is_retryable: route.is_retryable,
        timeout,
    })
}

/// Converts a request match. A match with several fields set requires all of
/// them.
fn request_match(m: api::RequestMatch) -> Result<RequestMatch> {
    let mut matches = Vec::new();
    if let Some(all) = m.all {
        matches.push(RequestMatch::All(
            all.into_iter().map(request_match).collect::<Result<_>>()?,
        ));
    }
    if let Some(any) = m.any {
        matches.push(RequestMatch::Any(
            any.into_iter().map(request_match).collect::<Result<_>>()?,
        ));
    }
    if let Some(method) = m.method {
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid method {method:?}"))?;
        matches.push(RequestMatch::Method(method));
    }
    if let Some(not) = m.not {
        matches.push(RequestMatch::Not(Box::new(request_match(*not)?)));
    }
    if let Some(path) = m.path_regex {
        matches.push(RequestMatch::path_regex(&path).context("invalid path regex")?);
    }
    single_or_all(matches, RequestMatch::All)
}

fn response_match(m: api::ResponseMatch) -> Result<ResponseMatch> {
    let mut matches = Vec::new();
    if let Some(all) = m.all {
        matches.push(ResponseMatch::All(
            all.into_iter().map(response_match).collect::<Result<_>>()?,
        ));
    }
    if let Some(any) = m.any {
        matches.push(ResponseMatch::Any(
            any.into_iter().map(response_match).collect::<Result<_>>()?,
        ));
    }
    if let Some(not) = m.not {
        matches.push(ResponseMatch::Not(Box::new(response_match(*not)?)));
    }
    if let Some(api::StatusRange { min, max }) = m.status {
        let min = min.unwrap_or(100);
        let max = max.unwrap_or(599);
        if min > max {
            bail!("status range minimum {min} exceeds maximum {max}");
        }
        matches.push(ResponseMatch::Status { min, max });
    }
    single_or_all(matches, ResponseMatch::All)
}

fn single_or_all<M>(mut matches: Vec<M>, all: impl FnOnce(Vec<M>) -> M) -> Result<M> {
    match matches.len() {
        0 => bail!("a match must have a field set"),
        1 => Ok(matches.remove(0)),
        _ => Ok(all(matches)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mk_route(name: &str, condition: api::RequestMatch) -> api::RouteSpec {
        api::RouteSpec {
            name: name.to_string(),
            condition,
            ..Default::default()
        }
    }

    #[test]
    fn converts_routes() {
        let spec = api::ServiceProfileSpec {
            routes: vec![api::RouteSpec {
                name: "GET /books/{id}".to_string(),
                condition: api::RequestMatch {
                    method: Some("get".to_string()),
                    path_regex: Some(r"/books/\d+".to_string()),
                    ..Default::default()
                },
                response_classes: vec![api::ResponseClass {
                    condition: api::ResponseMatch {
                        status: Some(api::StatusRange {
                            min: Some(500),
                            max: None,
                        }),
                        ..Default::default()
                    },
                    is_failure: true,
                }],
                is_retryable: true,
                timeout: Some("300ms".to_string()),
            }],
            retry_budget: Some(api::RetryBudget {
                retry_ratio: 0.2,
                min_retries_per_second: 10,
                ttl: "10s".to_string(),
            }),
        };

        let profile = convert("booksapp", "books.booksapp.svc.cluster.local", spec);
        assert_eq!(profile.routes.len(), 1);
        let route = &profile.routes[0];
        assert_eq!(
            route.condition,
            RequestMatch::All(vec![
                RequestMatch::Method(Method::GET),
                RequestMatch::path_regex(r"/books/\d+").unwrap(),
            ])
        );
        assert_eq!(
            route.response_classes,
            vec![ResponseClass {
                condition: ResponseMatch::Status { min: 500, max: 599 },
                is_failure: true,
            }]
        );
        assert!(route.is_retryable);
        assert_eq!(route.timeout, Some(Duration::from_millis(300)));
        assert_eq!(
            profile.retry_budget,
            Some(RetryBudget {
                retry_ratio: 0.2,
                min_retries_per_second: 10,
                ttl: Duration::from_secs(10),
            })
        );
    }

    #[test]
    fn skips_invalid_routes() {
        let spec = api::ServiceProfileSpec {
            routes: vec![
                mk_route(
                    "bad-regex",
                    api::RequestMatch {
                        path_regex: Some("/books/(".to_string()),
                        ..Default::default()
                    },
                ),
                api::RouteSpec {
                    timeout: Some("soon".to_string()),
                    ..mk_route(
                        "bad-timeout",
                        api::RequestMatch {
                            method: Some("GET".to_string()),
                            ..Default::default()
                        },
                    )
                },
                mk_route("empty", api::RequestMatch::default()),
                mk_route(
                    "not-post",
                    api::RequestMatch {
                        not: Some(Box::new(api::RequestMatch {
                            method: Some("POST".to_string()),
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                ),
            ],
            retry_budget: Some(api::RetryBudget {
                retry_ratio: 0.2,
                min_retries_per_second: 10,
                ttl: "forever".to_string(),
            }),
        };

        let profile = convert("ns", "svc.ns.svc.cluster.local", spec);
        let names = profile
            .routes
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["not-post"]);
        assert_eq!(
            profile.routes[0].condition,
            RequestMatch::Not(Box::new(RequestMatch::Method(Method::POST)))
        );
        assert_eq!(profile.retry_budget, None);
    }
}
