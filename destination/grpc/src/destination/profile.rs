use linkerd2_proxy_api::destination as proto;
use linkerd_destination_core::{Profile, RequestMatch, ResponseClass, ResponseMatch, RouteSpec};
use std::time;

/// Encodes a profile. Services without a profile are described by an empty
/// profile, which leaves the proxy's default routing in place.
pub(crate) fn to_proto(
    fully_qualified_name: String,
    profile: Option<&Profile>,
) -> proto::DestinationProfile {
    let Some(profile) = profile else {
        return proto::DestinationProfile {
            fully_qualified_name,
            ..Default::default()
        };
    };

    proto::DestinationProfile {
        fully_qualified_name,
        routes: profile.routes.iter().map(route).collect(),
        retry_budget: profile.retry_budget.map(|budget| proto::RetryBudget {
            retry_ratio: budget.retry_ratio,
            min_retries_per_second: budget.min_retries_per_second,
            ttl: convert_duration("retry budget ttl", budget.ttl),
        }),
        ..Default::default()
    }
}

fn route(route: &RouteSpec) -> proto::Route {
    proto::Route {
        condition: Some(request_match(&route.condition)),
        response_classes: route.response_classes.iter().map(response_class).collect(),
        metrics_labels: maplit::hashmap! {
            "route".to_string() => route.name.clone(),
        },
        is_retryable: route.is_retryable,
        timeout: route
            .timeout
            .and_then(|timeout| convert_duration("route timeout", timeout)),
        ..Default::default()
    }
}

fn request_match(m: &RequestMatch) -> proto::RequestMatch {
    use proto::request_match::{Match, Seq};

    let m = match m {
        RequestMatch::All(ms) => Match::All(Seq {
            matches: ms.iter().map(request_match).collect(),
        }),
        RequestMatch::Any(ms) => Match::Any(Seq {
            matches: ms.iter().map(request_match).collect(),
        }),
        RequestMatch::Not(m) => Match::Not(Box::new(request_match(m))),
        RequestMatch::Path(re) => Match::Path(proto::PathMatch {
            regex: re.as_str().to_string(),
        }),
        RequestMatch::Method(method) => Match::Method(method.clone().into()),
    };
    proto::RequestMatch { r#match: Some(m) }
}

fn response_class(class: &ResponseClass) -> proto::ResponseClass {
    proto::ResponseClass {
        condition: Some(response_match(&class.condition)),
        is_failure: class.is_failure,
    }
}

fn response_match(m: &ResponseMatch) -> proto::ResponseMatch {
    use proto::response_match::{Match, Seq};

    let m = match m {
        ResponseMatch::All(ms) => Match::All(Seq {
            matches: ms.iter().map(response_match).collect(),
        }),
        ResponseMatch::Any(ms) => Match::Any(Seq {
            matches: ms.iter().map(response_match).collect(),
        }),
        ResponseMatch::Not(m) => Match::Not(Box::new(response_match(m))),
        ResponseMatch::Status { min, max } => Match::Status(proto::HttpStatusRange {
            min: (*min).into(),
            max: (*max).into(),
        }),
    };
    proto::ResponseMatch { r#match: Some(m) }
}

fn convert_duration(name: &'static str, duration: time::Duration) -> Option<prost_types::Duration> {
    duration
        .try_into()
        .map_err(|error| {
            tracing::warn!(%error, "Invalid {name} duration");
        })
        .ok()
}
