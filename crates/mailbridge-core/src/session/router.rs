//! Routing of mailbox updates to per-address sinks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::queue::UpdateSink;
use crate::account::{AddressId, AddressMode};

type Routes = HashMap<AddressId, Arc<UpdateSink>>;

/// Maps address IDs to their update sink.
///
/// In combined mode every address shares one sink; in split mode each
/// address has its own. The mapping is swapped by reference, so readers see
/// either the old or the new mapping, never a mix.
#[derive(Debug, Default)]
pub struct UpdateRouter {
    routes: RwLock<Arc<Routes>>,
}

/// A sink set built for a mode but not yet installed.
#[derive(Debug)]
#[must_use = "staged routes must be committed or discarded"]
pub struct StagedRoutes {
    routes: Routes,
}

impl StagedRoutes {
    /// Number of distinct sinks in the staged set.
    #[must_use]
    pub fn distinct_len(&self) -> usize {
        distinct(&self.routes).len()
    }

    /// Close the staged sinks without installing them.
    pub fn discard(self) {
        for sink in distinct(&self.routes) {
            sink.close();
        }
    }
}

impl UpdateRouter {
    /// Build a router for the given mode. `ids` must list the primary address first.
    #[must_use]
    pub fn new(mode: AddressMode, ids: &[AddressId]) -> Self {
        Self {
            routes: RwLock::new(Arc::new(build(mode, ids))),
        }
    }

    /// Sink for an address.
    #[must_use]
    pub fn get(&self, id: &AddressId) -> Option<Arc<UpdateSink>> {
        self.current().get(id).cloned()
    }

    /// Every distinct sink, each listed once.
    #[must_use]
    pub fn distinct(&self) -> Vec<Arc<UpdateSink>> {
        distinct(&self.current())
    }

    /// Build a fresh sink set for `mode` without touching the installed one.
    pub fn stage(mode: AddressMode, ids: &[AddressId]) -> StagedRoutes {
        StagedRoutes {
            routes: build(mode, ids),
        }
    }

    /// Install a staged sink set and close every previously installed sink once.
    ///
    /// Returns the number of sinks closed.
    pub fn commit(&self, staged: StagedRoutes) -> usize {
        let old = {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *routes, Arc::new(staged.routes))
        };
        close_distinct(&old)
    }

    /// Rebuild the mapping for `mode`, closing the old sinks.
    ///
    /// Returns the number of sinks closed.
    pub fn rebuild(&self, mode: AddressMode, ids: &[AddressId]) -> usize {
        self.commit(Self::stage(mode, ids))
    }

    /// Route a newly created address.
    ///
    /// Split mode gives it a fresh sink; combined mode shares the existing one.
    pub fn add_address(&self, mode: AddressMode, id: &AddressId) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(id) {
            return;
        }

        let sink = match mode {
            AddressMode::Combined => routes
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| Arc::new(UpdateSink::new())),
            AddressMode::Split => Arc::new(UpdateSink::new()),
        };

        let mut next = (**routes).clone();
        next.insert(id.clone(), sink);
        *routes = Arc::new(next);
    }

    /// Stop routing a deleted address. Its sink is closed unless another address still uses it.
    pub fn remove_address(&self, id: &AddressId) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**routes).clone();
        let Some(sink) = next.remove(id) else {
            return;
        };

        if !next.values().any(|other| Arc::ptr_eq(other, &sink)) {
            sink.close();
            debug!(address_id = %id, "Closed update sink of removed address");
        }

        *routes = Arc::new(next);
    }

    /// Close every distinct sink once. Returns how many were closed by this call.
    pub fn close_all(&self) -> usize {
        close_distinct(&self.current())
    }

    fn current(&self) -> Arc<Routes> {
        Arc::clone(&self.routes.read().unwrap_or_else(PoisonError::into_inner))
    }
}

fn build(mode: AddressMode, ids: &[AddressId]) -> Routes {
    match mode {
        AddressMode::Combined => {
            let shared = Arc::new(UpdateSink::new());
            ids.iter()
                .map(|id| (id.clone(), Arc::clone(&shared)))
                .collect()
        }
        AddressMode::Split => ids
            .iter()
            .map(|id| (id.clone(), Arc::new(UpdateSink::new())))
            .collect(),
    }
}

fn distinct(routes: &Routes) -> Vec<Arc<UpdateSink>> {
    let mut unique: Vec<Arc<UpdateSink>> = Vec::new();
    for sink in routes.values() {
        if !unique.iter().any(|seen| Arc::ptr_eq(seen, sink)) {
            unique.push(Arc::clone(sink));
        }
    }
    unique
}

fn close_distinct(routes: &Routes) -> usize {
    distinct(routes)
        .iter()
        .filter(|sink| sink.close())
        .count()
}
