//! Builds label selectors and grouping clauses for resource queries.

use crate::{Resource, ResourceKind};
use std::{collections::BTreeMap, fmt};

/// A label selector, formatted as `{name="value", ...}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

/// A grouping clause, formatted as `name, ...`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelNames(Vec<String>);

const NAMESPACE: &str = "namespace";
const DST_NAMESPACE: &str = "dst_namespace";

/// Groups by namespace and, unless the resource is a namespace, by the
/// resource's own label.
pub fn group_by_labels(kind: ResourceKind) -> LabelNames {
    let mut names = LabelNames(vec![NAMESPACE.to_string()]);
    if kind != ResourceKind::Namespace {
        names.0.push(kind.label().to_string());
    }
    names
}

/// Selects a named resource. Services are not selected by name, since proxies
/// do not label inbound metrics with their services.
pub fn query_labels(resource: Option<&Resource>) -> LabelSet {
    let mut set = LabelSet::default();
    if let Some(resource) = resource {
        if !resource.name.is_empty() && resource.kind != ResourceKind::Service {
            set.insert(resource.kind.label(), &resource.name);
        }
        if should_add_namespace(resource) {
            set.insert(NAMESPACE, &resource.namespace);
        }
    }
    set
}

/// Selects a named destination resource.
pub fn dst_query_labels(resource: &Resource) -> LabelSet {
    let mut set = LabelSet::default();
    if !resource.name.is_empty() {
        if !resource.kind.is_k8s() {
            set.insert(resource.kind.label(), &resource.name);
        } else {
            set.insert(format!("dst_{}", resource.kind.label()), &resource.name);
            if should_add_namespace(resource) {
                set.insert(DST_NAMESPACE, &resource.namespace);
            }
        }
    }
    set
}

/// Selects inbound or outbound metrics.
pub fn direction_labels(direction: &str) -> LabelSet {
    let mut set = LabelSet::default();
    set.insert("direction", direction);
    set
}

fn should_add_namespace(resource: &Resource) -> bool {
    resource.kind != ResourceKind::Namespace && !resource.namespace.is_empty()
}

// === impl LabelSet ===

impl LabelSet {
    pub fn insert(&mut self, name: impl ToString, value: impl ToString) {
        self.0.insert(name.to_string(), value.to_string());
    }

    /// Combines two selectors. Labels in `other` take precedence.
    pub fn merge(mut self, other: LabelSet) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

impl<K: ToString, V: ToString> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === impl LabelNames ===

impl LabelNames {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for LabelNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}
