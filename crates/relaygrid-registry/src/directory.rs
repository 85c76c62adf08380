//! The service directory: registration, heartbeats, lookups and sweeps.
//!
//! Tracks which instances of which services are currently reachable.
//! The outer map is only locked to find or create a service bucket;
//! every other operation works under that bucket's own lock so traffic
//! for unrelated services never serializes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use relaygrid_core::{
    epoch_millis, InstanceSource, InstanceStatus, RegistrySettings, ServiceInstance, SharedClock,
    SystemClock,
};

use crate::error::{RegistryError, RegistryResult};

/// Lease timing applied to every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Silence after which an instance is no longer `Up`.
    pub lease_duration: Duration,
    /// Additional silence tolerated in `Expiring` before eviction.
    pub grace_period: Duration,
}

impl LeasePolicy {
    pub fn eviction_threshold(&self) -> Duration {
        self.lease_duration + self.grace_period
    }

    fn status_after(&self, silence: Duration) -> InstanceStatus {
        if silence < self.lease_duration {
            InstanceStatus::Up
        } else if silence < self.eviction_threshold() {
            InstanceStatus::Expiring
        } else {
            InstanceStatus::Removed
        }
    }
}

impl From<&RegistrySettings> for LeasePolicy {
    fn from(settings: &RegistrySettings) -> Self {
        Self {
            lease_duration: settings.lease_duration,
            grace_period: settings.grace_period,
        }
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::from(&RegistrySettings::default())
    }
}

/// Per-instance lease record.
#[derive(Debug, Clone)]
struct Lease {
    host: String,
    port: u16,
    /// Last status written by the sweep or a heartbeat.
    status: InstanceStatus,
    registered_at_ms: u64,
    last_heartbeat_ms: u64,
    last_renewal: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Keyed by instance id; iteration order is the lookup order.
    instances: BTreeMap<String, Lease>,
}

/// Counts per service for the directory overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub up: usize,
    pub expiring: usize,
}

/// Result of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Instances that moved from `Up` to `Expiring` during this pass.
    pub marked_expiring: usize,
    /// `(service, instance_id)` pairs deleted during this pass.
    pub evicted: Vec<(String, String)>,
}

/// In-memory service directory.
///
/// Owned by the process context (`Arc<Registry>`) rather than reached
/// through a global; dropping it forgets every instance.
#[derive(Debug)]
pub struct Registry {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    policy: LeasePolicy,
    clock: SharedClock,
}

impl Registry {
    /// Create an empty directory using real time.
    pub fn new(settings: &RegistrySettings) -> Self {
        Self::with_clock(LeasePolicy::from(settings), SystemClock::shared())
    }

    /// Create an empty directory with an explicit lease policy and clock.
    pub fn with_clock(policy: LeasePolicy, clock: SharedClock) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Register an instance, or refresh it if already known.
    ///
    /// Re-registering the same `(service, instance_id)` updates the
    /// address and resets the lease; duplicates are never an error.
    pub fn register(
        &self,
        service: &str,
        instance_id: &str,
        host: &str,
        port: u16,
    ) -> RegistryResult<ServiceInstance> {
        validate(service, instance_id, host, port)?;

        let now = self.clock.now();
        let wall = epoch_millis();

        let apply = |bucket: &mut Bucket| {
            let lease = bucket
                .instances
                .entry(instance_id.to_string())
                .and_modify(|lease| {
                    lease.host = host.to_string();
                    lease.port = port;
                    lease.status = InstanceStatus::Up;
                    lease.last_heartbeat_ms = wall;
                    lease.last_renewal = now;
                })
                .or_insert_with(|| Lease {
                    host: host.to_string(),
                    port,
                    status: InstanceStatus::Up,
                    registered_at_ms: wall,
                    last_heartbeat_ms: wall,
                    last_renewal: now,
                });
            snapshot(service, instance_id, lease, InstanceStatus::Up)
        };

        // Buckets are inserted into under the outer lock so a concurrent
        // sweep cannot prune a bucket between lookup and insert.
        let instance = {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            buckets.get(service).map(|bucket| apply(&mut *lock(bucket)))
        };
        let instance = match instance {
            Some(instance) => instance,
            None => {
                let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
                let bucket = buckets.entry(service.to_string()).or_default();
                apply(&mut *lock(bucket))
            }
        };

        info!(
            service,
            instance_id,
            endpoint = %instance.endpoint(),
            "instance registered"
        );
        Ok(instance)
    }

    /// Renew an instance's lease.
    ///
    /// Fails with `NotFound` if the instance is unknown or has already
    /// gone past the eviction threshold. A heartbeat on an `Expiring`
    /// instance brings it back to `Up`.
    pub fn heartbeat(&self, service: &str, instance_id: &str) -> RegistryResult<()> {
        let bucket = self
            .bucket(service)
            .ok_or_else(|| RegistryError::not_found(service, instance_id))?;
        let now = self.clock.now();
        let mut bucket = lock(&bucket);

        let Some(lease) = bucket.instances.get_mut(instance_id) else {
            warn!(service, instance_id, "heartbeat from unknown instance");
            return Err(RegistryError::not_found(service, instance_id));
        };

        match self.policy.status_after(now.saturating_duration_since(lease.last_renewal)) {
            InstanceStatus::Removed => {
                bucket.instances.remove(instance_id);
                warn!(service, instance_id, "heartbeat after lease expiry, instance evicted");
                Err(RegistryError::not_found(service, instance_id))
            }
            current => {
                if current == InstanceStatus::Expiring || lease.status == InstanceStatus::Expiring {
                    info!(service, instance_id, "expiring instance renewed");
                }
                lease.status = InstanceStatus::Up;
                lease.last_renewal = now;
                lease.last_heartbeat_ms = epoch_millis();
                debug!(service, instance_id, "heartbeat received");
                Ok(())
            }
        }
    }

    /// Remove an instance. Always succeeds; returns whether it existed.
    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let Some(bucket) = self.bucket(service) else {
            return false;
        };
        let existed = lock(&bucket).instances.remove(instance_id).is_some();
        if existed {
            info!(service, instance_id, "instance deregistered");
        }
        existed
    }

    /// Snapshot of the `Up` instances of a service, ordered by instance id.
    pub fn list_instances(&self, service: &str) -> Vec<ServiceInstance> {
        let Some(bucket) = self.bucket(service) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let bucket = lock(&bucket);

        bucket
            .instances
            .iter()
            .filter(|(_, lease)| self.current_status(lease, now) == InstanceStatus::Up)
            .map(|(id, lease)| snapshot(service, id, lease, InstanceStatus::Up))
            .collect()
    }

    /// Look up a single instance in whatever state it is in.
    pub fn get_instance(&self, service: &str, instance_id: &str) -> Option<ServiceInstance> {
        let bucket = self.bucket(service)?;
        let now = self.clock.now();
        let bucket = lock(&bucket);
        bucket
            .instances
            .get(instance_id)
            .map(|lease| snapshot(service, instance_id, lease, self.current_status(lease, now)))
    }

    /// Every known service with its live and expiring instance counts,
    /// sorted by name.
    pub fn list_services(&self) -> Vec<ServiceSummary> {
        let now = self.clock.now();
        let mut summaries: Vec<ServiceSummary> = self
            .bucket_snapshot()
            .into_iter()
            .filter_map(|(name, bucket)| {
                let bucket = lock(&bucket);
                let mut summary = ServiceSummary {
                    name,
                    up: 0,
                    expiring: 0,
                };
                for lease in bucket.instances.values() {
                    match self.current_status(lease, now) {
                        InstanceStatus::Up => summary.up += 1,
                        InstanceStatus::Expiring => summary.expiring += 1,
                        InstanceStatus::Removed => {}
                    }
                }
                (summary.up + summary.expiring > 0).then_some(summary)
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// One eviction pass.
    ///
    /// Snapshots the bucket list, then visits buckets one at a time so
    /// no lock is held across the whole scan. Empty buckets are pruned
    /// at the end.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut emptied = Vec::new();

        for (service, bucket) in self.bucket_snapshot() {
            let now = self.clock.now();
            let mut bucket = lock(&bucket);

            bucket.instances.retain(|id, lease| {
                match self.current_status(lease, now) {
                    InstanceStatus::Up => true,
                    InstanceStatus::Expiring => {
                        if lease.status == InstanceStatus::Up {
                            lease.status = InstanceStatus::Expiring;
                            stats.marked_expiring += 1;
                            warn!(service = %service, instance_id = %id, "lease expired, instance expiring");
                        }
                        true
                    }
                    InstanceStatus::Removed => {
                        warn!(service = %service, instance_id = %id, "instance evicted");
                        stats.evicted.push((service.clone(), id.clone()));
                        false
                    }
                }
            });

            if bucket.instances.is_empty() {
                emptied.push(service);
            }
        }

        if !emptied.is_empty() {
            let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
            for service in emptied {
                // Re-check under the outer lock; a register may have refilled it.
                let still_empty = buckets
                    .get(&service)
                    .is_some_and(|bucket| lock(bucket).instances.is_empty());
                if still_empty {
                    buckets.remove(&service);
                    debug!(service = %service, "pruned empty service");
                }
            }
        }

        if stats.marked_expiring > 0 || !stats.evicted.is_empty() {
            info!(
                expiring = stats.marked_expiring,
                evicted = stats.evicted.len(),
                "registry sweep complete"
            );
        }
        stats
    }

    fn current_status(&self, lease: &Lease, now: Instant) -> InstanceStatus {
        self.policy
            .status_after(now.saturating_duration_since(lease.last_renewal))
    }

    fn bucket(&self, service: &str) -> Option<Arc<Mutex<Bucket>>> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets.get(service).cloned()
    }

    fn bucket_snapshot(&self) -> Vec<(String, Arc<Mutex<Bucket>>)> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets
            .iter()
            .map(|(name, bucket)| (name.clone(), Arc::clone(bucket)))
            .collect()
    }
}

impl InstanceSource for Registry {
    fn live_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.list_instances(service_name)
    }
}

fn lock(bucket: &Mutex<Bucket>) -> MutexGuard<'_, Bucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

fn snapshot(service: &str, instance_id: &str, lease: &Lease, status: InstanceStatus) -> ServiceInstance {
    ServiceInstance {
        service_name: service.to_string(),
        instance_id: instance_id.to_string(),
        host: lease.host.clone(),
        port: lease.port,
        status,
        registered_at_ms: lease.registered_at_ms,
        last_heartbeat_ms: lease.last_heartbeat_ms,
    }
}

fn validate(service: &str, instance_id: &str, host: &str, port: u16) -> RegistryResult<()> {
    if service.trim().is_empty() {
        return Err(RegistryError::InvalidInstance("empty service name".to_string()));
    }
    if instance_id.trim().is_empty() {
        return Err(RegistryError::InvalidInstance("empty instance id".to_string()));
    }
    if host.trim().is_empty() {
        return Err(RegistryError::InvalidInstance(format!(
            "{service}/{instance_id}: empty host"
        )));
    }
    if port == 0 {
        return Err(RegistryError::InvalidInstance(format!(
            "{service}/{instance_id}: port must be non-zero"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::ManualClock;

    const LEASE: Duration = Duration::from_secs(60);
    const GRACE: Duration = Duration::from_secs(30);

    fn test_registry() -> (Registry, ManualClock) {
        let clock = ManualClock::new();
        let registry = Registry::with_clock(
            LeasePolicy {
                lease_duration: LEASE,
                grace_period: GRACE,
            },
            Arc::new(clock.clone()),
        );
        (registry, clock)
    }

    fn ids(instances: &[ServiceInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.instance_id.as_str()).collect()
    }

    #[test]
    fn register_then_list() {
        let (registry, _) = test_registry();
        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();

        let instances = registry.list_instances("accounts-service");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint(), "10.0.0.1:8080");
        assert_eq!(instances[0].status, InstanceStatus::Up);
    }

    #[test]
    fn repeated_register_and_heartbeat_keep_one_entry() {
        let (registry, clock) = test_registry();
        for _ in 0..5 {
            registry
                .register("accounts-service", "acc-1", "10.0.0.1", 8080)
                .unwrap();
            clock.advance(Duration::from_secs(10));
            registry.heartbeat("accounts-service", "acc-1").unwrap();
        }

        assert_eq!(ids(&registry.list_instances("accounts-service")), vec!["acc-1"]);
    }

    #[test]
    fn reregister_updates_address_and_keeps_registration_time() {
        let (registry, _) = test_registry();
        let first = registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();
        let second = registry
            .register("accounts-service", "acc-1", "10.0.0.9", 9090)
            .unwrap();

        assert_eq!(second.endpoint(), "10.0.0.9:9090");
        assert_eq!(second.registered_at_ms, first.registered_at_ms);
        assert_eq!(registry.list_instances("accounts-service").len(), 1);
    }

    #[test]
    fn register_rejects_malformed_input() {
        let (registry, _) = test_registry();
        assert!(matches!(
            registry.register("", "acc-1", "10.0.0.1", 8080),
            Err(RegistryError::InvalidInstance(_))
        ));
        assert!(registry.register("svc", " ", "10.0.0.1", 8080).is_err());
        assert!(registry.register("svc", "id", "", 8080).is_err());
        assert!(registry.register("svc", "id", "10.0.0.1", 0).is_err());
        assert!(registry.list_services().is_empty());
    }

    #[test]
    fn heartbeat_unknown_instance_is_not_found() {
        let (registry, _) = test_registry();
        assert_eq!(
            registry.heartbeat("accounts-service", "ghost"),
            Err(RegistryError::NotFound {
                service: "accounts-service".to_string(),
                instance_id: "ghost".to_string(),
            })
        );

        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();
        assert!(registry.heartbeat("accounts-service", "ghost").is_err());
    }

    #[test]
    fn instance_moves_up_expiring_removed() {
        let (registry, clock) = test_registry();
        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();

        clock.advance(LEASE - Duration::from_secs(1));
        assert_eq!(
            registry.get_instance("accounts-service", "acc-1").unwrap().status,
            InstanceStatus::Up
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            registry.get_instance("accounts-service", "acc-1").unwrap().status,
            InstanceStatus::Expiring
        );
        // Expiring instances are hidden from lookups even before a sweep.
        assert!(registry.list_instances("accounts-service").is_empty());

        clock.advance(GRACE);
        assert_eq!(
            registry.get_instance("accounts-service", "acc-1").unwrap().status,
            InstanceStatus::Removed
        );
    }

    #[test]
    fn heartbeat_revives_expiring_instance() {
        let (registry, clock) = test_registry();
        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();

        clock.advance(LEASE + Duration::from_secs(5));
        let stats = registry.sweep();
        assert_eq!(stats.marked_expiring, 1);

        registry.heartbeat("accounts-service", "acc-1").unwrap();
        assert_eq!(registry.list_instances("accounts-service").len(), 1);
    }

    #[test]
    fn heartbeat_after_eviction_threshold_is_not_found() {
        let (registry, clock) = test_registry();
        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();

        clock.advance(LEASE + GRACE);
        assert!(matches!(
            registry.heartbeat("accounts-service", "acc-1"),
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.get_instance("accounts-service", "acc-1").is_none());

        // Re-registering restores it.
        registry
            .register("accounts-service", "acc-1", "10.0.0.1", 8080)
            .unwrap();
        assert_eq!(registry.list_instances("accounts-service").len(), 1);
    }

    #[test]
    fn sweep_evicts_silent_instances_only() {
        let (registry, clock) = test_registry();
        registry.register("accounts-service", "acc-1", "10.0.0.1", 8080).unwrap();
        registry.register("accounts-service", "acc-2", "10.0.0.2", 8080).unwrap();

        clock.advance(Duration::from_secs(50));
        registry.heartbeat("accounts-service", "acc-2").unwrap();

        clock.advance(Duration::from_secs(41)); // acc-1 silent for 91s
        let stats = registry.sweep();

        assert_eq!(
            stats.evicted,
            vec![("accounts-service".to_string(), "acc-1".to_string())]
        );
        assert_eq!(ids(&registry.list_instances("accounts-service")), vec!["acc-2"]);
        assert!(registry.get_instance("accounts-service", "acc-1").is_none());
    }

    #[test]
    fn sweep_prunes_empty_services() {
        let (registry, clock) = test_registry();
        registry.register("cards-service", "c-1", "10.0.0.3", 8080).unwrap();

        clock.advance(LEASE + GRACE);
        registry.sweep();

        assert!(registry.list_services().is_empty());
        // The service can come back later.
        registry.register("cards-service", "c-2", "10.0.0.4", 8080).unwrap();
        assert_eq!(registry.list_services().len(), 1);
    }

    #[test]
    fn deregister_is_idempotent() {
        let (registry, _) = test_registry();
        registry.register("accounts-service", "acc-1", "10.0.0.1", 8080).unwrap();

        assert!(registry.deregister("accounts-service", "acc-1"));
        assert!(!registry.deregister("accounts-service", "acc-1"));
        assert!(!registry.deregister("unknown-service", "acc-1"));
        assert!(registry.list_instances("accounts-service").is_empty());
    }

    #[test]
    fn list_instances_is_ordered_by_id() {
        let (registry, _) = test_registry();
        registry.register("svc", "c", "10.0.0.3", 80).unwrap();
        registry.register("svc", "a", "10.0.0.1", 80).unwrap();
        registry.register("svc", "b", "10.0.0.2", 80).unwrap();

        assert_eq!(ids(&registry.list_instances("svc")), vec!["a", "b", "c"]);
    }

    #[test]
    fn services_are_isolated() {
        let (registry, _) = test_registry();
        registry.register("accounts-service", "acc-1", "10.0.0.1", 8080).unwrap();
        registry.register("cards-service", "acc-1", "10.0.0.2", 9000).unwrap();

        assert_eq!(registry.list_instances("accounts-service")[0].port, 8080);
        assert_eq!(registry.list_instances("cards-service")[0].port, 9000);
        assert!(registry.list_instances("loans-service").is_empty());
    }

    #[test]
    fn list_services_counts_up_and_expiring() {
        let (registry, clock) = test_registry();
        registry.register("accounts-service", "acc-1", "10.0.0.1", 8080).unwrap();
        clock.advance(LEASE);
        registry.register("accounts-service", "acc-2", "10.0.0.2", 8080).unwrap();
        registry.register("cards-service", "c-1", "10.0.0.3", 8080).unwrap();

        assert_eq!(
            registry.list_services(),
            vec![
                ServiceSummary {
                    name: "accounts-service".to_string(),
                    up: 1,
                    expiring: 1
                },
                ServiceSummary {
                    name: "cards-service".to_string(),
                    up: 1,
                    expiring: 0
                },
            ]
        );
    }

    #[test]
    fn instance_source_lists_live_instances() {
        let (registry, _) = test_registry();
        registry.register("accounts-service", "acc-1", "10.0.0.1", 8080).unwrap();
        let source: &dyn InstanceSource = &registry;
        assert_eq!(source.live_instances("accounts-service").len(), 1);
    }

    #[test]
    fn concurrent_registration_across_services() {
        let (registry, _) = test_registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let service = format!("svc-{}", t % 4);
                        let id = format!("inst-{t}-{i}");
                        registry.register(&service, &id, "10.0.0.1", 8080).unwrap();
                        registry.heartbeat(&service, &id).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let total: usize = registry.list_services().iter().map(|s| s.up).sum();
        assert_eq!(total, 400);
    }
}
