//! Endpoint resolution for consumer invocations.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use tramline_core::{Endpoint, Invocation, InvocationError, Response};

use super::{Handler, Next};

/// Resolves a target microservice to an address.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Picks one endpoint of `microservice` matching `version_rule`, or `None`
    /// if no instance is available.
    async fn resolve(
        &self,
        app_id: &str,
        microservice: &str,
        version_rule: &str,
    ) -> Option<Endpoint>;
}

/// In-memory registry of fixed endpoints, round-robin per microservice.
/// Ignores app id and version rule.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    endpoints: DashMap<String, (Vec<Endpoint>, usize)>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, microservice: impl Into<String>, endpoint: Endpoint) {
        self.endpoints
            .entry(microservice.into())
            .or_default()
            .0
            .push(endpoint);
    }

    pub fn remove(&self, microservice: &str) {
        self.endpoints.remove(microservice);
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, _app_id: &str, microservice: &str, _version_rule: &str) -> Option<Endpoint> {
        let mut entry = self.endpoints.get_mut(microservice)?;
        let (endpoints, cursor) = entry.value_mut();
        if endpoints.is_empty() {
            return None;
        }
        let picked = endpoints[*cursor % endpoints.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(picked)
    }
}

/// Sets the invocation's endpoint from discovery unless one is already set.
pub struct DiscoveryHandler {
    discovery: Arc<dyn ServiceDiscovery>,
}

impl DiscoveryHandler {
    #[must_use]
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self { discovery }
    }
}

#[async_trait]
impl Handler for DiscoveryHandler {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Response {
        if invocation.endpoint().is_none() {
            let Some(reference) = invocation.reference() else {
                return Response::failure(InvocationError::consumer_fail(format!(
                    "no reference for {}",
                    invocation.qualified_name()
                )));
            };
            let resolved = self
                .discovery
                .resolve(&reference.app_id, &reference.microservice, &reference.version_rule)
                .await;
            match resolved {
                Some(endpoint) => {
                    debug!(operation = %invocation.qualified_name(), %endpoint, "endpoint resolved");
                    invocation.set_endpoint(endpoint);
                }
                None => {
                    return Response::failure(InvocationError::consumer_fail(format!(
                        "no available endpoint for microservice {}",
                        invocation.microservice_name()
                    )));
                }
            }
        }
        next.run(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_over_instances() {
        let discovery = StaticDiscovery::new();
        discovery.add("orders", Endpoint::new("10.0.0.1:7070", true));
        discovery.add("orders", Endpoint::new("10.0.0.2:7070", true));
        let a = discovery.resolve("app", "orders", "0+").await.unwrap();
        let b = discovery.resolve("app", "orders", "0+").await.unwrap();
        let c = discovery.resolve("app", "orders", "0+").await.unwrap();
        assert_ne!(a.address, b.address);
        assert_eq!(a.address, c.address);
        assert!(discovery.resolve("app", "billing", "0+").await.is_none());
    }
}
