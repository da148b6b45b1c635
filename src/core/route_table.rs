//! The installed route table and its atomically-swappable cache.
//!
//! A [`RouteTable`] is rebuilt in full on every refresh, sorted once, and
//! installed into the [`RouteCache`] with an atomic pointer swap
//! (`arc_swap`). Readers always observe either the previous table or the
//! new one, never a partial state, and matching never takes a lock.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use arc_swap::ArcSwap;
use hyper::Method;

use crate::core::route::{Route, RouteSource};

/// An ordered, immutable sequence of routes.
///
/// Sort order is `(priority desc, local before remote, route_id asc)`; the
/// first route in table order whose pattern and method set admit the request
/// wins. A linear scan over the pre-sorted slice keeps the tie-break rules
/// trivially auditable at the route counts a gateway sees in practice.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn build(mut routes: Vec<Route>) -> Self {
        routes.retain(|r| r.enabled);
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| b.pattern.is_exact().cmp(&a.pattern.is_exact()))
                .then_with(|| a.route_id.cmp(&b.route_id))
        });
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// First-match lookup over the sorted table.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.matches(method, path))
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn count_by_source(&self, source: RouteSource) -> usize {
        self.routes.iter().filter(|r| r.source == source).count()
    }

    /// Every service id referenced by a route in this table.
    pub fn referenced_service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routes
            .iter()
            .filter_map(|r| match &r.target {
                crate::core::route::RouteTarget::Service(id) => Some(id.clone()),
                crate::core::route::RouteTarget::DirectUrl(_) => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Holds the current route table; single writer (the refresh task), many
/// lock-free readers.
pub struct RouteCache {
    table: ArcSwap<RouteTable>,
    registry_available: AtomicBool,
}

impl RouteCache {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            registry_available: AtomicBool::new(false),
        }
    }

    /// Current table snapshot. Non-blocking; valid from construction on
    /// (the initial table is empty until the first install).
    pub fn current(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn install(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
    }

    pub fn set_registry_available(&self, available: bool) {
        self.registry_available.store(available, Ordering::Release);
    }

    pub fn registry_available(&self) -> bool {
        self.registry_available.load(Ordering::Acquire)
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new()
    }
}
