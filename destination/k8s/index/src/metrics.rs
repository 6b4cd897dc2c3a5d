use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let ports_encoder = encoder.encode_descriptor(
            "service_port_index_size",
            "The number of service ports in the endpoints index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.service_ports() as u32).encode(ports_encoder)?;

        let endpoints_listeners_encoder = encoder.encode_descriptor(
            "endpoints_listeners",
            "The number of active endpoints subscriptions",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.endpoints_listeners() as u32).encode(endpoints_listeners_encoder)?;

        let profiles_encoder = encoder.encode_descriptor(
            "profile_index_size",
            "The number of ServiceProfile resources in the index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.profiles_len() as u32).encode(profiles_encoder)?;

        let profile_listeners_encoder = encoder.encode_descriptor(
            "profile_listeners",
            "The number of active profile subscriptions",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.profile_listeners() as u32).encode(profile_listeners_encoder)?;

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in the identity index",
            None,
            MetricType::Gauge,
        )?;
        let pods = this.pod_index();
        for ns in pods.namespaces() {
            let labels = vec![("namespace", ns)];
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            ConstGauge::new(pods.len(ns) as u32).encode(pods_encoder)?;
        }

        Ok(())
    }
}
