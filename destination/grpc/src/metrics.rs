//! Counts destination lookups and tracks the response streams that serve
//! them.

use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// The streaming lookups served to proxies.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Rpc {
    Get,
    GetProfile,
}

/// How a lookup was resolved.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Lookup {
    /// A response stream was opened.
    Subscribed,
    /// The destination path does not name a service in this cluster.
    InvalidPath,
    Failed,
}

#[derive(Clone, Debug)]
pub struct DestinationMetrics {
    lookups: Family<LookupLabels, Counter>,
    streams: Family<RpcLabels, Gauge>,
    updates: Family<RpcLabels, Counter>,
    stream_duration: Family<RpcLabels, Histogram>,
}

/// Metrics for one kind of lookup.
#[derive(Clone, Debug)]
pub(crate) struct RpcMetrics {
    rpc: Rpc,
    lookups: Family<LookupLabels, Counter>,
    streams: Gauge,
    updates: Counter,
    stream_duration: Histogram,
}

/// Held by a response stream while it is open.
#[derive(Debug)]
pub(crate) struct StreamMetrics {
    opened: time::Instant,
    streams: Gauge,
    updates: Counter,
    stream_duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RpcLabels {
    rpc: Rpc,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct LookupLabels {
    rpc: Rpc,
    result: Lookup,
}

// === impl DestinationMetrics ===

impl DestinationMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let lookups = Family::<LookupLabels, Counter>::default();
        reg.register(
            "lookups",
            "Destination lookups by their result",
            lookups.clone(),
        );

        let streams = Family::<RpcLabels, Gauge>::default();
        reg.register(
            "streams",
            "Response streams currently open",
            streams.clone(),
        );

        let updates = Family::<RpcLabels, Counter>::default();
        reg.register(
            "updates",
            "Updates sent on response streams",
            updates.clone(),
        );

        // Proxies hold a stream for as long as they route to the destination.
        let stream_duration = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([1.0, 10.0, 60.0, 600.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "stream_duration",
            "How long response streams stay open",
            Unit::Seconds,
            stream_duration.clone(),
        );

        Self {
            lookups,
            streams,
            updates,
            stream_duration,
        }
    }

    pub(crate) fn rpc(&self, rpc: Rpc) -> RpcMetrics {
        let labels = RpcLabels { rpc };
        RpcMetrics {
            rpc,
            lookups: self.lookups.clone(),
            streams: self.streams.get_or_create(&labels).clone(),
            updates: self.updates.get_or_create(&labels).clone(),
            stream_duration: self.stream_duration.get_or_create(&labels).clone(),
        }
    }
}

// === impl RpcMetrics ===

impl RpcMetrics {
    pub(crate) fn rejected(&self, result: Lookup) {
        self.lookup(result);
    }

    pub(crate) fn subscribed(&self) -> StreamMetrics {
        self.lookup(Lookup::Subscribed);
        self.streams.inc();
        StreamMetrics {
            opened: time::Instant::now(),
            streams: self.streams.clone(),
            updates: self.updates.clone(),
            stream_duration: self.stream_duration.clone(),
        }
    }

    fn lookup(&self, result: Lookup) {
        self.lookups
            .get_or_create(&LookupLabels {
                rpc: self.rpc,
                result,
            })
            .inc();
    }
}

// === impl StreamMetrics ===

impl StreamMetrics {
    pub(crate) fn update_sent(&self) {
        self.updates.inc();
    }
}

impl Drop for StreamMetrics {
    fn drop(&mut self) {
        self.streams.dec();
        self.stream_duration
            .observe(self.opened.elapsed().as_secs_f64());
    }
}
