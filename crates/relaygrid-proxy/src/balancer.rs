//! Load-balancing policies.
//!
//! Round-robin keeps a cursor per service. The cursor is tied to the
//! shape of the instance list it last saw: when an instance is added or
//! removed the cursor starts over, and every pick is taken modulo the
//! current candidate count rather than trusting old positions.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::Rng;
use tracing::debug;

use relaygrid_core::{LoadBalancerPolicy, ServiceInstance};

#[derive(Debug, Default)]
struct Cursor {
    shape: u64,
    next: usize,
}

/// Picks one instance out of a live list.
#[derive(Debug)]
pub struct LoadBalancer {
    policy: LoadBalancerPolicy,
    cursors: RwLock<HashMap<String, Arc<Mutex<Cursor>>>>,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancerPolicy) -> Self {
        Self {
            policy,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> LoadBalancerPolicy {
        self.policy
    }

    /// Choose an instance of `service`, skipping ids in `exclude`.
    ///
    /// Returns `None` when no candidate is left.
    pub fn choose<'a>(
        &self,
        service: &str,
        instances: &'a [ServiceInstance],
        exclude: &[String],
    ) -> Option<&'a ServiceInstance> {
        let candidates: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| !exclude.contains(&i.instance_id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let idx = match self.policy {
            LoadBalancerPolicy::RoundRobin => self.next_index(service, instances, candidates.len()),
            LoadBalancerPolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        Some(candidates[idx])
    }

    fn next_index(&self, service: &str, instances: &[ServiceInstance], count: usize) -> usize {
        let cursor = self.cursor(service);
        let mut cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);

        let shape = shape_of(instances);
        if cursor.shape != shape {
            debug!(service, instances = instances.len(), "instance set changed, cursor reset");
            cursor.shape = shape;
            cursor.next = 0;
        }

        let idx = cursor.next % count;
        cursor.next = cursor.next.wrapping_add(1);
        idx
    }

    fn cursor(&self, service: &str) -> Arc<Mutex<Cursor>> {
        {
            let cursors = self.cursors.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cursor) = cursors.get(service) {
                return Arc::clone(cursor);
            }
        }
        let mut cursors = self.cursors.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cursors.entry(service.to_string()).or_default())
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancerPolicy::RoundRobin)
    }
}

/// Fingerprint of the instance set (ids and endpoints, in list order).
fn shape_of(instances: &[ServiceInstance]) -> u64 {
    let mut hasher = DefaultHasher::new();
    instances.len().hash(&mut hasher);
    for instance in instances {
        instance.instance_id.hash(&mut hasher);
        instance.host.hash(&mut hasher);
        instance.port.hash(&mut hasher);
    }
    hasher.finish()
}
