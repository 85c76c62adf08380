//! relaygrid-registry: the service directory.
//!
//! Instances register themselves under a logical service name and keep
//! their lease alive with periodic heartbeats. A background sweep marks
//! silent instances `Expiring` and evicts them once the grace period
//! has run out.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── RwLock<service name → bucket>   (held only to find/create buckets)
//!   │   └── Mutex<bucket>               (instance id → lease)
//!   └── Clock                           (lease accounting)
//!
//! Sweeper task
//!   └── every sweep_interval: snapshot buckets, then evict one bucket at a time
//! ```
//!
//! State is in-memory only; a restart forgets every instance and relies
//! on instances re-registering.

pub mod directory;
pub mod error;
pub mod sweeper;

pub use directory::{LeasePolicy, Registry, ServiceSummary, SweepStats};
pub use error::{RegistryError, RegistryResult};
pub use sweeper::{run_sweeper, spawn_sweeper};
