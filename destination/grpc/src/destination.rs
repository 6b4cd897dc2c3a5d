use crate::metrics::{DestinationMetrics, Lookup, Rpc, RpcMetrics, StreamMetrics};
use futures::prelude::*;
use linkerd2_proxy_api::{
    destination::{
        self as proto,
        destination_server::{Destination, DestinationServer as Svc},
    },
    net::TcpAddress,
};
use linkerd_destination_core::{
    Closed, DiscoverDestination, Endpoint, EndpointsListener, Profile, ProfileListener, ServiceRef,
};
use std::{collections::HashMap, num::NonZeroU16, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span};

mod profile;


/// The weight assigned to every address. Load balancing across a service's
/// endpoints is uniform.
const DEFAULT_WEIGHT: u32 = 10_000;

/// The number of messages buffered for a client before the forwarding
/// listener waits on it.
const STREAM_BUFFER: usize = 10;

/// Serves endpoint and profile streams to proxies.
#[derive(Clone, Debug)]
pub struct DestinationServer<T> {
    discover: T,
    // Used to parse destinations of the form <svc>.<ns>.svc.<cluster-domain>.
    cluster_domain: Arc<str>,
    drain: drain::Watch,
    get_metrics: RpcMetrics,
    profile_metrics: RpcMetrics,
}

/// A destination path, resolved to a service port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub service: ServiceRef,
    pub port: NonZeroU16,
}

type BoxUpdateStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<proto::Update, tonic::Status>> + Send + Sync>>;

type BoxProfileStream = std::pin::Pin<
    Box<dyn Stream<Item = Result<proto::DestinationProfile, tonic::Status>> + Send + Sync>,
>;

/// Forwards endpoint notifications onto a client's response stream.
struct ForwardEndpoints {
    service: ServiceRef,
    tx: mpsc::Sender<proto::Update>,
}

/// Forwards profile notifications onto a client's response stream.
struct ForwardProfile {
    fully_qualified_name: String,
    tx: mpsc::Sender<proto::DestinationProfile>,
}

// === impl DestinationServer ===

impl<T> DestinationServer<T>
where
    T: DiscoverDestination + Send + Sync + 'static,
{
    pub fn new(
        discover: T,
        cluster_domain: impl Into<Arc<str>>,
        drain: drain::Watch,
        metrics: DestinationMetrics,
    ) -> Self {
        Self {
            discover,
            cluster_domain: cluster_domain.into(),
            drain,
            get_metrics: metrics.rpc(Rpc::Get),
            profile_metrics: metrics.rpc(Rpc::GetProfile),
        }
    }

    pub fn svc(self) -> Svc<Self> {
        Svc::new(self)
    }

    /// Parses a destination path of the form
    /// `<name>.<namespace>.svc.<cluster-domain>[:<port>]`. The port defaults to
    /// 80.
    pub fn lookup(&self, path: &str) -> Result<Target, tonic::Status> {
        let invalid = || {
            tonic::Status::invalid_argument(format!(
                "destination must be of the form <name>.<namespace>.svc.{}[:<port>]: {path}",
                self.cluster_domain
            ))
        };

        let auth = path
            .parse::<http::uri::Authority>()
            .map_err(|_| invalid())?;
        let has_port = auth.as_str().len() > auth.host().len();
        let port = match auth.port_u16() {
            Some(port) => NonZeroU16::new(port).ok_or_else(invalid)?,
            None if has_port => return Err(invalid()),
            None => NonZeroU16::new(80).ok_or_else(invalid)?,
        };

        let host = auth.host().trim_end_matches('.');
        let host = host
            .strip_suffix(&*self.cluster_domain)
            .and_then(|h| h.strip_suffix('.'))
            .ok_or_else(invalid)?;

        let mut parts = host.split('.');
        let name = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let namespace = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        if parts.next() != Some("svc") || parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Target {
            service: ServiceRef::new(namespace, name),
            port,
        })
    }
}

#[async_trait::async_trait]
impl<T> Destination for DestinationServer<T>
where
    T: DiscoverDestination + Send + Sync + 'static,
{
    type GetStream = BoxUpdateStream;

    async fn get(
        &self,
        req: tonic::Request<proto::GetDestination>,
    ) -> Result<tonic::Response<BoxUpdateStream>, tonic::Status> {
        let req = req.into_inner();
        let Target { service, port } = match self.lookup(&req.path) {
            Ok(target) => target,
            Err(status) => {
                self.get_metrics.rejected(Lookup::InvalidPath);
                return Err(status);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (closed_tx, closed) = liveness();
        let listener = ForwardEndpoints {
            service: service.clone(),
            tx,
        };
        let span = info_span!("get", %service, %port);
        if let Err(error) = self.discover.subscribe_endpoints(
            service,
            port,
            Box::new(listener),
            closed,
        ) {
            self.get_metrics.rejected(Lookup::Failed);
            return Err(tonic::Status::internal(format!("lookup failed: {error}")));
        }

        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            rx,
            closed_tx,
            self.get_metrics.subscribed(),
            span,
        )))
    }

    type GetProfileStream = BoxProfileStream;

    async fn get_profile(
        &self,
        req: tonic::Request<proto::GetDestination>,
    ) -> Result<tonic::Response<BoxProfileStream>, tonic::Status> {
        let req = req.into_inner();
        let Target { service, .. } = match self.lookup(&req.path) {
            Ok(target) => target,
            Err(status) => {
                self.profile_metrics.rejected(Lookup::InvalidPath);
                return Err(status);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (closed_tx, closed) = liveness();
        let listener = ForwardProfile {
            fully_qualified_name: service.fqdn(&self.cluster_domain),
            tx,
        };
        let span = info_span!("get_profile", %service);
        if let Err(error) = self
            .discover
            .subscribe_profile(service, Box::new(listener), closed)
        {
            self.profile_metrics.rejected(Lookup::Failed);
            return Err(tonic::Status::internal(format!("lookup failed: {error}")));
        }

        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            rx,
            closed_tx,
            self.profile_metrics.subscribed(),
            span,
        )))
    }
}

/// Returns a liveness signal that fires when the returned sender is dropped.
fn liveness() -> (oneshot::Sender<()>, Closed) {
    let (tx, rx) = oneshot::channel::<()>();
    (tx, Box::pin(rx.map(|_| ())))
}

/// Streams messages until the listener goes away or the server begins
/// draining. Dropping the stream, as happens when the client disconnects,
/// fires the subscription's liveness signal.
fn response_stream<M>(
    drain: drain::Watch,
    mut rx: mpsc::Receiver<M>,
    closed: oneshot::Sender<()>,
    metrics: StreamMetrics,
    span: tracing::Span,
) -> std::pin::Pin<Box<dyn Stream<Item = Result<M, tonic::Status>> + Send + Sync>>
where
    M: Send + Sync + 'static,
{
    Box::pin(async_stream::try_stream! {
        let _closed = closed;
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        metrics.update_sent();
                        yield msg;
                    }
                    // The subscription was dropped, e.g. because this client
                    // fell behind. The client must resubscribe.
                    None => {
                        debug!(parent: &span, "Subscription ended");
                        return;
                    }
                },

                // If the server starts shutting down, close the stream so that
                // it doesn't hold the server open.
                _ = &mut shutdown => {
                    debug!(parent: &span, "Shutting down");
                    return;
                }
            }
        }
    })
}

// === impl ForwardEndpoints ===

#[async_trait::async_trait]
impl EndpointsListener for ForwardEndpoints {
    async fn update(&mut self, added: Vec<Endpoint>, removed: Vec<Endpoint>) {
        if !removed.is_empty() {
            let remove = proto::update::Update::Remove(proto::AddrSet {
                addrs: removed.iter().map(|ep| TcpAddress::from(ep.addr)).collect(),
            });
            if self.send(remove).await.is_err() {
                return;
            }
        }

        if !added.is_empty() {
            let add = proto::update::Update::Add(proto::WeightedAddrSet {
                addrs: added.iter().map(to_weighted_addr).collect(),
                metric_labels: maplit::hashmap! {
                    "namespace".to_string() => self.service.namespace.clone(),
                    "service".to_string() => self.service.name.clone(),
                },
            });
            let _ = self.send(add).await;
        }
    }

    async fn no_endpoints(&mut self, exists: bool) {
        let update = proto::update::Update::NoEndpoints(proto::NoEndpoints { exists });
        let _ = self.send(update).await;
    }
}

impl ForwardEndpoints {
    async fn send(&self, update: proto::update::Update) -> Result<(), ()> {
        self.tx
            .send(proto::Update {
                update: Some(update),
            })
            .await
            .map_err(|_| ())
    }
}

fn to_weighted_addr(ep: &Endpoint) -> proto::WeightedAddr {
    let mut metric_labels = HashMap::new();
    if let Some(owner) = &ep.owner {
        metric_labels.insert("pod".to_string(), owner.pod.clone());
        if owner.kind != "pod" {
            metric_labels.insert(owner.kind.clone(), owner.name.clone());
        }
    }
    proto::WeightedAddr {
        addr: Some(ep.addr.into()),
        weight: DEFAULT_WEIGHT,
        metric_labels,
        ..Default::default()
    }
}

// === impl ForwardProfile ===

#[async_trait::async_trait]
impl ProfileListener for ForwardProfile {
    async fn update(&mut self, profile: Option<Arc<Profile>>) {
        let msg = profile::to_proto(self.fully_qualified_name.clone(), profile.as_deref());
        let _ = self.tx.send(msg).await;
    }
}
