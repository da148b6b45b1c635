//! Periodic route and instance refresh.
//!
//! The poller is the single writer of the route cache. Each refresh pulls
//! the remote route list, re-reads the instance sets for every referenced
//! service, merges remote routes with the (boosted) local ones and installs
//! the rebuilt table in one atomic swap. A failing registry is never fatal:
//! depending on `fallback_to_local` the gateway either serves local routes
//! only or keeps the previous table until the registry recovers.

use std::{sync::Arc, time::Duration};

use eyre::Result;
use tokio::time::{sleep, timeout};

use crate::{
    core::{
        balancer::InstanceRegistry,
        route::{Route, RouteSource, RouteTarget},
        route_table::{RouteCache, RouteTable},
    },
    ports::registry::{RegistryProvider, RemoteRoute},
};

pub struct RoutePollerSettings {
    pub poll_interval: Duration,
    pub bootstrap_timeout: Duration,
    pub fallback_to_local: bool,
}

pub struct RoutePoller {
    registry: Option<Arc<dyn RegistryProvider>>,
    cache: Arc<RouteCache>,
    instances: Arc<InstanceRegistry>,
    local_routes: Vec<Route>,
    settings: RoutePollerSettings,
}

impl RoutePoller {
    pub fn new(
        registry: Option<Arc<dyn RegistryProvider>>,
        cache: Arc<RouteCache>,
        instances: Arc<InstanceRegistry>,
        local_routes: Vec<Route>,
        settings: RoutePollerSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            instances,
            local_routes,
            settings,
        }
    }

    /// Install local routes immediately, then block on the first registry
    /// refresh up to the bootstrap timeout. On expiry the gateway starts
    /// with local-only routing and the background loop catches up later.
    pub async fn bootstrap(&self) {
        self.install_local_only();

        if self.registry.is_none() {
            tracing::info!(
                local_routes = self.local_routes.len(),
                "registry disabled, serving local routes only"
            );
            return;
        }

        match timeout(self.settings.bootstrap_timeout, self.refresh()).await {
            Ok(Ok(())) => {
                let table = self.cache.current();
                tracing::info!(
                    total = table.len(),
                    remote = table.count_by_source(RouteSource::Remote),
                    local = table.count_by_source(RouteSource::Local),
                    "route table bootstrapped from registry"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "initial registry refresh failed, continuing with local routes");
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.settings.bootstrap_timeout,
                    "initial registry refresh timed out, continuing with local routes"
                );
            }
        }
    }

    /// Refresh loop; runs until the task is dropped at shutdown.
    pub async fn run(&self) {
        if self.registry.is_none() {
            return;
        }
        loop {
            sleep(self.settings.poll_interval).await;
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "registry refresh failed");
            }
        }
    }

    /// One full refresh: routes, then instances, then the table swap.
    pub async fn refresh(&self) -> Result<()> {
        let Some(registry) = &self.registry else {
            self.install_local_only();
            return Ok(());
        };

        let remote = match registry.fetch_routes().await {
            Ok(remote) => remote,
            Err(e) => {
                self.cache.set_registry_available(false);
                if self.settings.fallback_to_local {
                    self.install_local_only();
                }
                return Err(eyre::eyre!("fetching routes: {e}"));
            }
        };

        let remote_routes = parse_remote_routes(remote);
        let mut all_routes = remote_routes;
        all_routes.extend(self.local_routes.iter().cloned());

        self.refresh_instances(registry.as_ref(), &all_routes).await;

        let table = RouteTable::build(all_routes);
        tracing::debug!(
            total = table.len(),
            remote = table.count_by_source(RouteSource::Remote),
            local = table.count_by_source(RouteSource::Local),
            "route table refreshed"
        );
        self.cache.install(table);
        self.cache.set_registry_available(true);
        Ok(())
    }

    async fn refresh_instances(&self, registry: &dyn RegistryProvider, routes: &[Route]) {
        let mut service_ids: Vec<&str> = routes
            .iter()
            .filter_map(|r| match &r.target {
                RouteTarget::Service(id) => Some(id.as_str()),
                RouteTarget::DirectUrl(_) => None,
            })
            .collect();
        service_ids.sort_unstable();
        service_ids.dedup();

        for service_id in service_ids {
            match registry.fetch_instances(service_id).await {
                Ok(records) => self.instances.replace(service_id, records),
                Err(e) => {
                    // The previous instance set stays in place; a transient
                    // per-service failure should not empty the healthy set.
                    tracing::warn!(service_id, error = %e, "instance refresh failed");
                }
            }
        }
    }

    fn install_local_only(&self) {
        self.cache
            .install(RouteTable::build(self.local_routes.clone()));
    }
}

fn parse_remote_routes(remote: Vec<RemoteRoute>) -> Vec<Route> {
    let mut routes = Vec::with_capacity(remote.len());
    for raw in remote {
        let route_id = raw.route_id.clone();
        match Route::from_entry(raw.entry, route_id.clone(), RouteSource::Remote, 0, None) {
            Ok(route) => routes.push(route),
            Err(e) => {
                tracing::warn!(route_id = %route_id, error = %e, "skipping malformed remote route");
            }
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use hyper::Method;

    use super::*;
    use crate::{
        config::models::RouteEntry,
        ports::registry::{InstanceRecord, RegistryError},
    };

    struct StubRegistry {
        failing: AtomicBool,
    }

    #[async_trait]
    impl RegistryProvider for StubRegistry {
        async fn fetch_routes(&self) -> Result<Vec<RemoteRoute>, RegistryError> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(RegistryError::Status(500));
            }
            Ok(vec![
                serde_json::from_value(serde_json::json!({
                    "route_id": 1,
                    "path_pattern": "/api/**",
                    "target_service_id": "users",
                    "priority": 100
                }))
                .unwrap(),
                // Malformed: both targets set; must be dropped, not fatal.
                serde_json::from_value(serde_json::json!({
                    "route_id": 2,
                    "path_pattern": "/broken/**",
                    "target_url": "http://x",
                    "target_service_id": "y"
                }))
                .unwrap(),
            ])
        }

        async fn fetch_instances(
            &self,
            service_id: &str,
        ) -> Result<Vec<InstanceRecord>, RegistryError> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(RegistryError::Status(500));
            }
            Ok(vec![InstanceRecord {
                instance_id: format!("{service_id}-1"),
                base_url: format!("http://{service_id}:8080"),
                healthy: true,
            }])
        }
    }

    fn local_route(pattern: &str) -> Route {
        let entry = RouteEntry {
            path_pattern: pattern.to_string(),
            target_url: Some("http://local-backend".to_string()),
            ..RouteEntry::default()
        };
        Route::from_entry(entry, "local-1".into(), RouteSource::Local, 1000, None).unwrap()
    }

    fn poller(registry: Arc<StubRegistry>) -> (RoutePoller, Arc<RouteCache>, Arc<InstanceRegistry>) {
        let cache = Arc::new(RouteCache::new());
        let instances = Arc::new(InstanceRegistry::new());
        let poller = RoutePoller::new(
            Some(registry),
            cache.clone(),
            instances.clone(),
            vec![local_route("/local/**")],
            RoutePollerSettings {
                poll_interval: Duration::from_secs(30),
                bootstrap_timeout: Duration::from_secs(1),
                fallback_to_local: true,
            },
        );
        (poller, cache, instances)
    }

    #[tokio::test]
    async fn refresh_merges_remote_and_local_and_drops_malformed() {
        let registry = Arc::new(StubRegistry {
            failing: AtomicBool::new(false),
        });
        let (poller, cache, instances) = poller(registry);

        poller.refresh().await.unwrap();

        let table = cache.current();
        assert_eq!(table.len(), 2);
        assert_eq!(table.count_by_source(RouteSource::Remote), 1);
        assert_eq!(table.count_by_source(RouteSource::Local), 1);
        assert!(cache.registry_available());

        // Boosted local route outranks the remote one.
        assert_eq!(table.routes()[0].route_id, "local-1");

        // Instances for the referenced service were pulled in.
        assert_eq!(instances.snapshot("users").len(), 1);
    }

    #[tokio::test]
    async fn registry_failure_falls_back_to_local_and_recovers() {
        let registry = Arc::new(StubRegistry {
            failing: AtomicBool::new(true),
        });
        let (poller, cache, _instances) = poller(registry.clone());

        assert!(poller.refresh().await.is_err());
        let table = cache.current();
        assert_eq!(table.len(), 1);
        assert_eq!(table.count_by_source(RouteSource::Local), 1);
        assert!(!cache.registry_available());

        // Recovery reinstates merged routing.
        registry.failing.store(false, Ordering::Relaxed);
        poller.refresh().await.unwrap();
        let table = cache.current();
        assert_eq!(table.len(), 2);
        assert!(cache.registry_available());
        assert!(
            table
                .match_route(&Method::GET, "/api/users")
                .is_some()
        );
    }

    #[tokio::test]
    async fn bootstrap_installs_local_routes_first() {
        let registry = Arc::new(StubRegistry {
            failing: AtomicBool::new(true),
        });
        let (poller, cache, _instances) = poller(registry);

        poller.bootstrap().await;
        let table = cache.current();
        assert_eq!(table.len(), 1);
        assert!(table.match_route(&Method::GET, "/local/x").is_some());
    }
}
