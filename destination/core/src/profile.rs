pub use http::Method;
use regex::Regex;
use std::{sync::Arc, time};

/// Receives profile updates for a single service.
#[async_trait::async_trait]
pub trait ProfileListener: Send + 'static {
    /// Replaces the service's profile. `None` indicates that the service has
    /// no profile, in which case default routing applies.
    async fn update(&mut self, profile: Option<Arc<Profile>>);
}

/// Describes how requests to a service are classified, retried and timed out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    pub routes: Vec<RouteSpec>,
    pub retry_budget: Option<RetryBudget>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteSpec {
    pub name: String,
    pub condition: RequestMatch,
    pub response_classes: Vec<ResponseClass>,
    pub is_retryable: bool,
    pub timeout: Option<time::Duration>,
}

#[derive(Clone, Debug)]
pub enum RequestMatch {
    All(Vec<RequestMatch>),
    Any(Vec<RequestMatch>),
    Not(Box<RequestMatch>),
    Path(Regex),
    Method(Method),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseClass {
    pub condition: ResponseMatch,
    pub is_failure: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseMatch {
    All(Vec<ResponseMatch>),
    Any(Vec<ResponseMatch>),
    Not(Box<ResponseMatch>),
    Status { min: u16, max: u16 },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RetryBudget {
    pub retry_ratio: f32,
    pub min_retries_per_second: u32,
    pub ttl: time::Duration,
}

// === impl RequestMatch ===

impl RequestMatch {
    pub fn path_regex(s: &str) -> anyhow::Result<Self> {
        Ok(Self::Path(Regex::new(s)?))
    }
}

impl PartialEq for RequestMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::All(l), Self::All(r)) => l == r,
            (Self::Any(l), Self::Any(r)) => l == r,
            (Self::Not(l), Self::Not(r)) => l == r,
            (Self::Path(l), Self::Path(r)) => l.as_str() == r.as_str(),
            (Self::Method(l), Self::Method(r)) => l == r,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_path_regex() {
        assert!(RequestMatch::path_regex("/books/(").is_err());
    }

    #[test]
    fn path_regexes_compare_by_pattern() {
        let books = RequestMatch::path_regex(r"/books/\d+").unwrap();
        assert_eq!(books, RequestMatch::path_regex(r"/books/\d+").unwrap());
        assert_ne!(books, RequestMatch::path_regex(r"/authors/\d+").unwrap());
        assert_ne!(
            RequestMatch::Not(Box::new(books.clone())),
            RequestMatch::Any(vec![books]),
        );
    }
}
