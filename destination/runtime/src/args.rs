use crate::{
    api::{self, Api},
    grpc::{self, metrics::DestinationMetrics},
    index::{self, ClusterInfo},
    k8s,
    primed::Primed,
    profiles, prometheus, DestinationDiscover,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, warn, Instrument};

const PROMETHEUS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(
    name = "destination",
    about = "Serves service discovery to Linkerd proxies",
    args_conflicts_with_subcommands = true
)]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8086")]
    grpc_addr: SocketAddr,

    /// Serves the public HTTP API.
    #[clap(long, default_value = "0.0.0.0:8085")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "linkerd")]
    control_plane_namespace: String,

    #[clap(long, default_value = "http://127.0.0.1:9090")]
    prometheus_url: String,

    /// The number of updates buffered for each subscriber before it is
    /// disconnected.
    #[clap(long, default_value = "100")]
    listener_queue_capacity: usize,

    /// Namespaces whose pods are omitted from pod listings.
    #[clap(long, default_value = "kube-system", value_delimiter = ',')]
    ignore_namespaces: Vec<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Writes a ServiceProfile derived from a protobuf service definition.
    Profile {
        /// A `.proto` file.
        #[clap(long)]
        proto: PathBuf,

        #[clap(long, short = 'n', default_value = "default")]
        namespace: String,

        #[clap(long, default_value = "cluster.local")]
        cluster_domain: String,

        /// The name of the service being profiled.
        service: String,
    },
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            api_addr,
            cluster_domain,
            control_plane_namespace,
            prometheus_url,
            listener_queue_capacity,
            ignore_namespaces,
            command,
        } = self;

        if let Some(Command::Profile {
            proto,
            namespace,
            cluster_domain,
            service,
        }) = command
        {
            let input = std::fs::File::open(&proto)
                .with_context(|| format!("failed to open {}", proto.display()))?;
            profiles::render_proto(
                input,
                &namespace,
                &service,
                &cluster_domain,
                std::io::stdout().lock(),
            )?;
            return Ok(());
        }

        let cluster_info = Arc::new(ClusterInfo {
            control_plane_ns: control_plane_namespace.clone(),
            dns_domain: cluster_domain.clone(),
            listener_queue_capacity,
        });
        let index = index::Index::shared(cluster_info);

        let mut prom = <Registry>::default();
        index::metrics::register(
            prom.sub_registry_with_prefix("destination_index"),
            index.clone(),
        );
        let grpc_metrics =
            DestinationMetrics::register(prom.sub_registry_with_prefix("destination"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches. Discovery is not served until each has
        // delivered its initial state.
        let mut primed = Primed::default();

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), primed.watch("services", services))
                .instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), primed.watch("endpoints", endpoints))
                .instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), primed.watch("pods", pods))
                .instrument(info_span!("pods")),
        );

        let replica_sets = runtime.watch_all::<k8s::ReplicaSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), primed.watch("replicasets", replica_sets))
                .instrument(info_span!("replicasets")),
        );

        let service_profiles =
            runtime.watch_all::<k8s::ServiceProfile>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                index.clone(),
                primed.watch("serviceprofiles", service_profiles),
            )
            .instrument(info_span!("serviceprofiles")),
        );

        let discover = DestinationDiscover::new(index);

        // Run the gRPC server once the caches are primed.
        tokio::spawn(grpc(
            grpc_addr,
            cluster_domain,
            discover.clone(),
            grpc_metrics,
            primed,
            runtime.shutdown_handle(),
        ));

        let prometheus = prometheus::Client::new(&prometheus_url, PROMETHEUS_TIMEOUT)?;
        let api = Api::new(
            discover,
            prometheus,
            control_plane_namespace,
            ignore_namespaces,
        );
        tokio::spawn(
            api::serve(api_addr, api, runtime.shutdown_handle()).map(|res| {
                if let Err(error) = res {
                    warn!(%error, "HTTP API server failed");
                }
            }),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    cluster_domain: String,
    discover: DestinationDiscover,
    metrics: DestinationMetrics,
    primed: Primed,
    drain: drain::Watch,
) -> Result<()> {
    tokio::select! {
        primed = primed.wait() => {
            if !primed {
                bail!("a watch ended before its initial list completed");
            }
        }
        _handle = drain.clone().signaled() => return Ok(()),
    }

    let svc = grpc::DestinationServer::new(discover, cluster_domain, drain.clone(), metrics).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
