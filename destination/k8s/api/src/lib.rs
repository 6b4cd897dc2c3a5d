#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod profile;

pub use self::profile::{ServiceProfile, ServiceProfileSpec};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::ReplicaSet,
        core::v1::{
            EndpointAddress, EndpointSubset, Endpoints, ObjectReference, Pod, PodSpec, PodStatus,
            Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};
pub use kube::{Resource, ResourceExt};
