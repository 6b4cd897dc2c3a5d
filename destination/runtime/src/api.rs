//! The public HTTP API, consumed by operator tooling.
//!
//! Each endpoint accepts a JSON request body with a `POST`:
//!
//! - `/api/v1/Endpoints` returns every service port known to the index.
//! - `/api/v1/ListPods` lists pods, noting whether each is meshed.
//! - `/api/v1/StatSummary` summarizes traffic for a kind of resource.

use crate::{
    core::DiscoverDestination,
    prometheus::{
        pods::{meshed_pods, ListPodsRequest},
        stat::{stat_summary, PodOwner, StatRequest},
        QueryApi,
    },
    DestinationDiscover,
};
use bytes::Bytes;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use serde::Serialize;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Clone, Debug)]
pub(crate) struct Api<Q> {
    discover: DestinationDiscover,
    prometheus: Q,
    control_plane_ns: Arc<str>,
    ignore_namespaces: Arc<[String]>,
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),
}

type Body = http_body_util::Full<Bytes>;

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointsResponse {
    /// Keyed by `<name>.<namespace>`.
    service_ports: BTreeMap<String, ServicePort>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServicePort {
    port_endpoints: BTreeMap<u16, PodAddresses>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodAddresses {
    pod_addresses: Vec<PodAddress>,
}

#[derive(Debug, PartialEq, Serialize)]
struct PodAddress {
    addr: SocketAddr,

    /// `<namespace>/<pod>`, absent for unmeshed addresses.
    pod: Option<String>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct ListPodsResponse {
    pods: Vec<Pod>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pod {
    /// `<namespace>/<pod>`
    name: String,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    status: Option<String>,
    owner_kind: String,
    owner_name: String,

    /// Whether the pod's proxy is reporting metrics.
    added: bool,
    controller_namespace: Option<String>,
    control_plane: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Accepts HTTP/1 connections until the process begins shutting down.
#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve<Q>(addr: SocketAddr, api: Api<Q>, drain: drain::Watch) -> anyhow::Result<()>
where
    Q: QueryApi,
{
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API server listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            release = &mut shutdown => {
                drop(release);
                return Ok(());
            }
        };

        let api = api.clone();
        let drain = drain.clone();
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                tower::Service::call(&mut api.clone(), req)
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(io), svc);
            tokio::pin!(conn);
            tokio::select! {
                res = &mut conn => {
                    if let Err(error) = res {
                        debug!(%client, %error, "Connection failed");
                    }
                }
                release = drain.signaled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                    drop(release);
                }
            }
        });
    }
}

// === impl Api ===

impl<Q> tower::Service<Request<hyper::body::Incoming>> for Api<Q>
where
    Q: QueryApi,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST {
            return Box::pin(future::ok(status_response(
                http::StatusCode::METHOD_NOT_ALLOWED,
            )));
        }

        let api = self.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let body = req.into_body().collect().await?.to_bytes();
            Ok(api.handle(&path, body).await)
        })
    }
}

impl<Q> Api<Q>
where
    Q: QueryApi,
{
    pub(crate) fn new(
        discover: DestinationDiscover,
        prometheus: Q,
        control_plane_ns: impl Into<Arc<str>>,
        ignore_namespaces: Vec<String>,
    ) -> Self {
        Self {
            discover,
            prometheus,
            control_plane_ns: control_plane_ns.into(),
            ignore_namespaces: ignore_namespaces.into(),
        }
    }

    async fn handle(&self, path: &str, body: Bytes) -> Response<Body> {
        debug!(%path, "Handling request");
        match path {
            "/api/v1/Endpoints" => json_response(http::StatusCode::OK, &self.endpoints()),

            "/api/v1/ListPods" => {
                let req = match parse::<ListPodsRequest>(&body) {
                    Ok(req) => req,
                    Err(rsp) => return rsp,
                };
                match self.list_pods(req).await {
                    Ok(pods) => json_response(http::StatusCode::OK, &pods),
                    Err(error) => error_response(error),
                }
            }

            "/api/v1/StatSummary" => {
                let req = match parse::<StatRequest>(&body) {
                    Ok(req) => req,
                    Err(rsp) => return rsp,
                };
                match stat_summary(&self.prometheus, &req, &self.pod_owners()).await {
                    Ok(summary) => json_response(http::StatusCode::OK, &summary),
                    Err(error) => error_response(error),
                }
            }

            _ => status_response(http::StatusCode::NOT_FOUND),
        }
    }

    fn endpoints(&self) -> EndpointsResponse {
        let mut rsp = EndpointsResponse::default();
        for snapshot in self.discover.endpoints_snapshot() {
            let key = format!("{}.{}", snapshot.service.name, snapshot.service.namespace);
            let pod_addresses = snapshot
                .endpoints
                .into_iter()
                .map(|ep| PodAddress {
                    addr: ep.addr,
                    pod: ep.owner.map(|o| o.to_string()),
                })
                .collect();
            rsp.service_ports
                .entry(key)
                .or_default()
                .port_endpoints
                .insert(snapshot.port.get(), PodAddresses { pod_addresses });
        }
        rsp
    }

    async fn list_pods(&self, req: ListPodsRequest) -> Result<ListPodsResponse, crate::prometheus::Error> {
        let resource = req.validate()?;
        let namespace = req.namespace.as_deref().filter(|ns| !ns.is_empty());
        let reporting = meshed_pods(&self.prometheus, namespace).await?;

        let pods = self
            .discover
            .pods(namespace)
            .into_iter()
            .filter(|pod| !self.ignore_namespaces.contains(&pod.namespace))
            .filter(|pod| {
                resource.as_ref().map_or(true, |r| {
                    r.selects_pod(&pod.namespace, &pod.name, &pod.owner_kind, &pod.owner_name)
                })
            })
            .map(|pod| {
                let added = reporting.contains_key(&(pod.namespace.clone(), pod.name.clone()));
                Pod {
                    name: format!("{}/{}", pod.namespace, pod.name),
                    pod_ip: pod.ip.map(|ip| ip.to_string()),
                    status: pod.phase,
                    owner_kind: pod.owner_kind,
                    owner_name: pod.owner_name,
                    added,
                    control_plane: *pod.namespace == *self.control_plane_ns,
                    controller_namespace: pod.control_plane_ns,
                }
            })
            .collect();
        Ok(ListPodsResponse { pods })
    }

    fn pod_owners(&self) -> Vec<PodOwner> {
        self.discover
            .pods(None)
            .into_iter()
            .map(|pod| PodOwner {
                namespace: pod.namespace,
                name: pod.name,
                owner_kind: pod.owner_kind,
                owner_name: pod.owner_name,
            })
            .collect()
    }
}

fn parse<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response<Body>> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|error| {
        warn!(%error, "Failed to parse request body");
        json_response(
            http::StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: error.to_string(),
            },
        )
    })
}

fn error_response(error: crate::prometheus::Error) -> Response<Body> {
    let status = if error.is_invalid() {
        http::StatusCode::BAD_REQUEST
    } else {
        warn!(%error, "Request failed");
        http::StatusCode::BAD_GATEWAY
    };
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
        },
    )
}

fn json_response(status: http::StatusCode, body: &impl Serialize) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::default())),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            status_response(http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status_response(status: http::StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = status;
    rsp
}
