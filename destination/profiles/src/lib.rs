//! Derives ServiceProfiles from protobuf service definitions.
//!
//! Each method of each service becomes a route that matches `POST` requests to
//! the method's gRPC path. Derivation is offline; it does not depend on cluster
//! state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod parse;

pub use self::parse::{parse, Node, ParseError};
use linkerd_destination_k8s_api::profile::{
    RequestMatch, RouteSpec, ServiceProfile, ServiceProfileSpec,
};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read definition: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse definition: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to render profile: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Builds the profile for `<service>.<namespace>.svc.<cluster_domain>` from
/// parsed declarations.
///
/// A method's path is qualified by the last package declared before its
/// service.
pub fn service_profile(
    nodes: &[Node],
    namespace: &str,
    service: &str,
    cluster_domain: &str,
) -> ServiceProfile {
    let mut package = None;
    let mut routes = Vec::new();
    for node in nodes {
        match node {
            Node::Package(name) => package = Some(name.as_str()),
            Node::Service(_) => {}
            Node::Method { service, name } => {
                let path = match package {
                    Some(package) => format!("/{package}.{service}/{name}"),
                    None => format!("/{service}/{name}"),
                };
                tracing::debug!(%path, "Adding route");
                routes.push(RouteSpec {
                    name: name.clone(),
                    condition: RequestMatch {
                        method: Some(http::Method::POST.to_string()),
                        path_regex: Some(regex::escape(&path)),
                        ..Default::default()
                    },
                    ..Default::default()
                });
            }
        }
    }

    let mut profile = ServiceProfile::new(
        &format!("{service}.{namespace}.svc.{cluster_domain}"),
        ServiceProfileSpec {
            routes,
            retry_budget: None,
        },
    );
    profile.metadata.namespace = Some(namespace.to_string());
    profile
}

/// Reads a protobuf definition and writes the corresponding ServiceProfile as
/// YAML.
pub fn render_proto(
    mut input: impl io::Read,
    namespace: &str,
    service: &str,
    cluster_domain: &str,
    output: impl io::Write,
) -> Result<(), Error> {
    let mut definition = String::new();
    input.read_to_string(&mut definition)?;
    let nodes = parse(&definition)?;
    let profile = service_profile(&nodes, namespace, service, cluster_domain);
    serde_yaml::to_writer(output, &profile)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOTING: &str = r#"
        syntax = "proto3";

        package emojivoto.v1;

        message VoteRequest {}
        message VoteResponse {}

        service VotingService {
            rpc VoteFish(VoteRequest) returns (VoteResponse);
        }
    "#;

    #[test]
    fn derives_one_route_per_method() {
        let nodes = parse(VOTING).unwrap();
        let profile = service_profile(&nodes, "emojivoto", "voting", "cluster.local");

        assert_eq!(
            profile.metadata.name.as_deref(),
            Some("voting.emojivoto.svc.cluster.local")
        );
        assert_eq!(profile.metadata.namespace.as_deref(), Some("emojivoto"));
        assert_eq!(
            profile.spec.routes,
            vec![RouteSpec {
                name: "VoteFish".to_string(),
                condition: RequestMatch {
                    method: Some("POST".to_string()),
                    path_regex: Some(r"/emojivoto\.v1\.VotingService/VoteFish".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }]
        );

        // The escaped path matches only the literal method path.
        let re = regex::Regex::new(profile.spec.routes[0].condition.path_regex.as_ref().unwrap())
            .unwrap();
        assert!(re.is_match("/emojivoto.v1.VotingService/VoteFish"));
        assert!(!re.is_match("/emojivotoXv1.VotingService/VoteFish"));
    }

    #[test]
    fn qualifies_methods_by_the_preceding_package() {
        let nodes = parse(
            r#"
            service Health { rpc Check(Req) returns (Rsp); }
            package books.v1;
            service Books { rpc List(Req) returns (Rsp); }
            package books.v2;
            service Books { rpc List(Req) returns (Rsp); }
            "#,
        )
        .unwrap();
        let profile = service_profile(&nodes, "booksapp", "books", "example.org");
        assert_eq!(
            profile.metadata.name.as_deref(),
            Some("books.booksapp.svc.example.org")
        );
        let paths = profile
            .spec
            .routes
            .iter()
            .filter_map(|r| r.condition.path_regex.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                r"/Health/Check",
                r"/books\.v1\.Books/List",
                r"/books\.v2\.Books/List",
            ]
        );
    }

    #[test]
    fn renders_yaml() {
        let mut out = Vec::new();
        render_proto(VOTING.as_bytes(), "emojivoto", "voting", "cluster.local", &mut out)
            .unwrap();
        let yaml = String::from_utf8(out).unwrap();
        assert!(yaml.contains("apiVersion: linkerd.io/v1alpha2"), "{yaml}");
        assert!(yaml.contains("kind: ServiceProfile"), "{yaml}");

        let profile = serde_yaml::from_str::<ServiceProfile>(&yaml).unwrap();
        assert_eq!(
            profile.metadata.name.as_deref(),
            Some("voting.emojivoto.svc.cluster.local")
        );
        assert_eq!(profile.spec.routes.len(), 1);
        assert_eq!(profile.spec.routes[0].name, "VoteFish");
    }

    #[test]
    fn rejects_invalid_definitions() {
        let err = render_proto(
            "service {".as_bytes(),
            "ns",
            "svc",
            "cluster.local",
            io::sink(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::Unexpected { .. })), "{err}");
    }
}
