//! Service instance registry and load balancing.
//!
//! The [`InstanceRegistry`] holds the healthy set per service id as reported
//! by the registry; the refresh task replaces each set wholesale while
//! carrying the process-local `active_conn_count` over by instance id. The
//! [`LoadBalancer`] picks one instance per request from a snapshot of the
//! healthy set and hands back a [`PickedInstance`] whose guard restores the
//! connection count on drop, so cancellation and error paths release it
//! without explicit bookkeeping.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::{
    config::models::LoadBalanceStrategy,
    core::error::GatewayError,
    ports::registry::InstanceRecord,
};

/// One network endpoint belonging to a service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub base_url: String,
    pub healthy: bool,
    active: Arc<AtomicUsize>,
}

impl ServiceInstance {
    pub fn new(instance_id: String, base_url: String, healthy: bool) -> Self {
        Self {
            instance_id,
            base_url,
            healthy,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Per-service instance sets, keyed by service id.
pub struct InstanceRegistry {
    services: scc::HashMap<String, Vec<ServiceInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            services: scc::HashMap::new(),
        }
    }

    /// Replace a service's instance set with a fresh registry snapshot,
    /// preserving in-flight connection counters by instance id.
    pub fn replace(&self, service_id: &str, records: Vec<InstanceRecord>) {
        let previous = self.snapshot(service_id);
        let next: Vec<ServiceInstance> = records
            .into_iter()
            .map(|record| {
                let carried = previous
                    .iter()
                    .find(|i| i.instance_id == record.instance_id)
                    .map(|i| i.active.clone());
                ServiceInstance {
                    instance_id: record.instance_id,
                    base_url: record.base_url,
                    healthy: record.healthy,
                    active: carried.unwrap_or_else(|| Arc::new(AtomicUsize::new(0))),
                }
            })
            .collect();

        let replaced = self
            .services
            .update(&service_id.to_string(), |_, v| *v = next.clone());
        if replaced.is_none() {
            let _ = self.services.insert(service_id.to_string(), next);
        }
    }

    /// Snapshot of a service's instances (counters stay shared).
    pub fn snapshot(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.services
            .read(service_id, |_, v| v.clone())
            .unwrap_or_default()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn healthy_instance_count(&self) -> usize {
        let mut count = 0;
        self.services.scan(|_, instances| {
            count += instances.iter().filter(|i| i.healthy).count();
        });
        count
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII increment of an instance's active connection count; the decrement
/// runs on drop, whichever way the request ends.
#[derive(Debug)]
pub struct ConnGuard {
    active: Arc<AtomicUsize>,
}

impl ConnGuard {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            active: active.clone(),
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A balancer pick: the chosen endpoint plus its live connection guard.
#[derive(Debug)]
pub struct PickedInstance {
    pub instance_id: String,
    pub base_url: String,
    _guard: ConnGuard,
}

/// Picks one instance per request from a service's healthy set.
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    registry: Arc<InstanceRegistry>,
    rr_counters: scc::HashMap<String, Arc<AtomicUsize>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            strategy,
            registry,
            rr_counters: scc::HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Select a healthy instance, failing fast when the set is empty.
    pub fn pick(&self, service_id: &str) -> Result<PickedInstance, GatewayError> {
        let healthy: Vec<ServiceInstance> = self
            .registry
            .snapshot(service_id)
            .into_iter()
            .filter(|i| i.healthy)
            .collect();

        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyInstance {
                service_id: service_id.to_string(),
            });
        }

        let chosen = match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let index = self.next_round_robin(service_id) % healthy.len();
                &healthy[index]
            }
            LoadBalanceStrategy::Random => {
                let index = rand::rng().random_range(0..healthy.len());
                &healthy[index]
            }
            LoadBalanceStrategy::LeastConn => {
                // Ties broken randomly so concurrent picks don't all pile
                // onto the same freshly-idle instance.
                let min = healthy
                    .iter()
                    .map(|i| i.active_connections())
                    .min()
                    .unwrap_or(0);
                let candidates: Vec<&ServiceInstance> = healthy
                    .iter()
                    .filter(|i| i.active_connections() == min)
                    .collect();
                let index = if candidates.len() > 1 {
                    rand::rng().random_range(0..candidates.len())
                } else {
                    0
                };
                candidates[index]
            }
        };

        Ok(PickedInstance {
            instance_id: chosen.instance_id.clone(),
            base_url: chosen.base_url.clone(),
            _guard: ConnGuard::acquire(&chosen.active),
        })
    }

    fn next_round_robin(&self, service_id: &str) -> usize {
        loop {
            if let Some(counter) = self.rr_counters.read(service_id, |_, c| c.clone()) {
                return counter.fetch_add(1, Ordering::Relaxed);
            }
            let _ = self
                .rr_counters
                .insert(service_id.to_string(), Arc::new(AtomicUsize::new(0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, healthy: bool) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            base_url: format!("http://{id}:8080"),
            healthy,
        }
    }

    fn balancer_with(
        strategy: LoadBalanceStrategy,
        records: Vec<InstanceRecord>,
    ) -> LoadBalancer {
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace("svc", records);
        LoadBalancer::new(strategy, registry)
    }

    #[test]
    fn round_robin_cycles_healthy_instances() {
        let lb = balancer_with(
            LoadBalanceStrategy::RoundRobin,
            vec![record("i1", true), record("i2", true), record("i3", false)],
        );

        let first = lb.pick("svc").unwrap();
        let second = lb.pick("svc").unwrap();
        let third = lb.pick("svc").unwrap();

        assert_eq!(first.instance_id, "i1");
        assert_eq!(second.instance_id, "i2");
        assert_eq!(third.instance_id, "i1");
    }

    #[test]
    fn no_healthy_instance_fails_fast() {
        let lb = balancer_with(
            LoadBalanceStrategy::RoundRobin,
            vec![record("i1", false)],
        );
        assert!(matches!(
            lb.pick("svc"),
            Err(GatewayError::NoHealthyInstance { .. })
        ));
        assert!(matches!(
            lb.pick("unknown"),
            Err(GatewayError::NoHealthyInstance { .. })
        ));
    }

    #[test]
    fn least_conn_picks_idle_instance_and_releases_on_drop() {
        let lb = balancer_with(
            LoadBalanceStrategy::LeastConn,
            vec![record("i1", true), record("i2", true), record("i3", true)],
        );

        // Occupy i1 with two connections and i3 with one.
        let snapshot = lb.registry().snapshot("svc");
        let hold_a = ConnGuard::acquire(&snapshot[0].active);
        let hold_b = ConnGuard::acquire(&snapshot[0].active);
        let hold_c = ConnGuard::acquire(&snapshot[2].active);

        let picked = lb.pick("svc").unwrap();
        assert_eq!(picked.instance_id, "i2");
        assert_eq!(snapshot[1].active_connections(), 1);

        drop(picked);
        assert_eq!(snapshot[1].active_connections(), 0);
        drop((hold_a, hold_b, hold_c));
    }

    #[test]
    fn replace_preserves_counters_for_surviving_instances() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace("svc", vec![record("i1", true)]);

        let before = registry.snapshot("svc");
        let guard = ConnGuard::acquire(&before[0].active);

        registry.replace("svc", vec![record("i1", true), record("i2", true)]);
        let after = registry.snapshot("svc");
        assert_eq!(after[0].active_connections(), 1);
        assert_eq!(after[1].active_connections(), 0);
        drop(guard);
        assert_eq!(registry.snapshot("svc")[0].active_connections(), 0);
    }
}
