//! Gate adapter contract: turning requests into identifiers and decisions
//! into HTTP status codes and rate limit headers.
//!
//! The HTTP framework itself stays outside this crate. Anything that can
//! hand over an [`http::HeaderMap`] and a peer address can use [`Gate`].

use std::net::IpAddr;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::ratelimit::{
    parse_forwarded_list, Decision, Identifier, Policy, PolicyCatalog, Record, RecordStore,
    RequestMeta, RouteClass,
};

/// `X-Forwarded-For`
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

impl RequestMeta {
    /// Collect origin metadata from request headers and the peer address.
    ///
    /// Repeated `X-Forwarded-For` headers are concatenated in order. Values
    /// that are not valid UTF-8 are ignored.
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let forwarded_for = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_forwarded_list)
            .collect();

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            forwarded_for,
            peer_addr: peer.map(|ip| ip.to_string()),
            user_agent,
        }
    }
}

/// Front door used by request handlers.
pub struct Gate {
    store: Arc<RecordStore>,
    catalog: PolicyCatalog,
}

impl Gate {
    /// Create a gate over a shared store.
    pub fn new(store: Arc<RecordStore>, catalog: PolicyCatalog) -> Self {
        Self { store, catalog }
    }

    /// Evaluate a request for a route class.
    #[instrument(skip_all, fields(route = %route))]
    pub fn check(&self, route: RouteClass, meta: &RequestMeta) -> Verdict {
        let identifier = Identifier::derive(meta);
        let policy = self.catalog.get(route);
        let (decision, evaluated_at_ms) = self
            .store
            .evaluate_timed(&identifier.scoped(route.as_str()), &policy);

        debug!(
            identifier = %identifier,
            allowed = decision.allowed,
            "Gate decision made"
        );

        Verdict {
            route,
            identifier,
            policy,
            decision,
            evaluated_at_ms,
        }
    }

    /// Reset a client's history for one route class.
    pub fn clear(&self, route: RouteClass, identifier: &Identifier) {
        self.store.clear(&identifier.scoped(route.as_str()));
    }

    /// Inspect a client's record for one route class.
    pub fn status(&self, route: RouteClass, identifier: &Identifier) -> Option<Record> {
        self.store.status(&identifier.scoped(route.as_str()))
    }

    /// The policies in force.
    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }
}

/// A decision together with what is needed to render it.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Route class the request was checked against
    pub route: RouteClass,
    /// Derived client identifier, before route scoping
    #[serde(serialize_with = "serialize_identifier")]
    pub identifier: Identifier,
    /// Policy in force for the route class
    pub policy: Policy,
    /// What the engine decided
    pub decision: Decision,
    /// Time the decision was taken (epoch ms)
    pub evaluated_at_ms: u64,
}

fn serialize_identifier<S: serde::Serializer>(
    id: &Identifier,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(id.as_str())
}

impl Verdict {
    /// Whether the request may reach its handler.
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    /// Status to respond with when the request is refused, `200 OK` otherwise.
    pub fn status(&self) -> StatusCode {
        if self.decision.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }

    /// Rate limit headers for the response.
    pub fn headers(&self) -> HeaderMap {
        rate_limit_headers(&self.decision, &self.policy, self.evaluated_at_ms)
    }
}

/// Map a decision to response headers.
///
/// Denials carry `Retry-After` in whole seconds (rounded up, at least one),
/// the limit, and a zero remaining count. Allowed requests carry the limit,
/// the remaining count and the window reset in epoch seconds.
pub fn rate_limit_headers(decision: &Decision, policy: &Policy, now_ms: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(policy.max_attempts));

    if decision.allowed {
        if let Some(remaining) = decision.remaining {
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
        }
        if let Some(reset_at) = decision.reset_at {
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at.div_ceil(1000)));
        }
    } else {
        let retry_at = decision.retry_after.or(decision.reset_at).unwrap_or(now_ms);
        let wait_secs = retry_at.saturating_sub(now_ms).div_ceil(1000).max(1);
        headers.insert(RETRY_AFTER, HeaderValue::from(wait_secs));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
    }

    headers
}
