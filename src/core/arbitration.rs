//! Exclusive access arbitration for shared console lines
//!
//! The multiplexer service enforces the real cross-process lock. This table
//! mirrors what the local process knows about it, so contention and forced
//! takeover are visible in-process and a deposed channel fails on its next
//! I/O call.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Shared line identifier: `(host, device)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Multiplexer host
    pub host: String,
    /// Device name on that host
    pub device: String,
}

impl ResourceId {
    /// Create a resource identifier
    pub fn new(host: &str, device: &str) -> Self {
        Self {
            host: host.to_string(),
            device: device.to_string(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.device)
    }
}

/// How a lease is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquireMode {
    /// Fail if somebody holds the line
    Cooperative,
    /// Take the line, invalidating the current holder
    Forced,
}

/// Cooperative acquisition hit a held line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{resource} is held by {holder}")]
pub struct Contention {
    /// Contended resource
    pub resource: ResourceId,
    /// Current holder
    pub holder: String,
}

#[derive(Debug)]
struct LeaseRecord {
    holder: String,
    mode: AcquireMode,
    generation: u64,
    valid: Arc<AtomicBool>,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    leases: HashMap<ResourceId, LeaseRecord>,
    generation: u64,
}

/// Ownership of a shared line
///
/// Cloning a lease does not duplicate ownership; all clones observe the same
/// validity flag.
#[derive(Debug, Clone)]
pub struct ArbiterLease {
    resource: ResourceId,
    holder: String,
    mode: AcquireMode,
    generation: u64,
    valid: Arc<AtomicBool>,
    preempted: Option<String>,
}

impl ArbiterLease {
    /// Leased resource
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Holder identity
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquisition mode
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// False once a forced acquisition displaced this lease or it was released
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Holder displaced by this (forced) acquisition, if any
    pub fn preempted_holder(&self) -> Option<&str> {
        self.preempted.as_deref()
    }
}

/// Lease table keyed by resource
#[derive(Debug, Default)]
pub struct ExclusivityArbiter {
    table: Mutex<LeaseTable>,
}

impl ExclusivityArbiter {
    /// Create an empty arbiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty arbiter ready to be shared between connectors
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Acquire `resource` for `holder`
    pub fn acquire(
        &self,
        resource: &ResourceId,
        holder: &str,
        mode: AcquireMode,
    ) -> Result<ArbiterLease, Contention> {
        let mut table = self.table.lock();

        let mut preempted = None;
        if let Some(current) = table.leases.get(resource) {
            if mode == AcquireMode::Cooperative {
                return Err(Contention {
                    resource: resource.clone(),
                    holder: current.holder.clone(),
                });
            }
            current.valid.store(false, Ordering::Release);
            tracing::info!(
                %resource,
                previous = %current.holder,
                held_for = ?current.acquired_at.elapsed(),
                "forced takeover invalidates lease"
            );
            preempted = Some(current.holder.clone());
        }

        table.generation += 1;
        let generation = table.generation;
        let valid = Arc::new(AtomicBool::new(true));
        table.leases.insert(
            resource.clone(),
            LeaseRecord {
                holder: holder.to_string(),
                mode,
                generation,
                valid: valid.clone(),
                acquired_at: Instant::now(),
            },
        );

        tracing::debug!(%resource, holder, ?mode, generation, "lease acquired");
        Ok(ArbiterLease {
            resource: resource.clone(),
            holder: holder.to_string(),
            mode,
            generation,
            valid,
            preempted,
        })
    }

    /// Release `lease` if it is still the current holder of its resource.
    ///
    /// Returns whether anything was removed. A stale lease (displaced by a
    /// forced acquisition) never clobbers the newer holder.
    pub fn release(&self, lease: &ArbiterLease) -> bool {
        let mut table = self.table.lock();
        let current = table
            .leases
            .get(&lease.resource)
            .is_some_and(|record| record.generation == lease.generation);

        lease.valid.store(false, Ordering::Release);
        if current {
            table.leases.remove(&lease.resource);
            tracing::debug!(resource = %lease.resource, holder = %lease.holder, "lease released");
        }
        current
    }

    /// Current holder of `resource`
    pub fn holder(&self, resource: &ResourceId) -> Option<String> {
        self.table
            .lock()
            .leases
            .get(resource)
            .map(|record| record.holder.clone())
    }

    /// Mode and age of the current lease on `resource`
    pub fn lease_info(&self, resource: &ResourceId) -> Option<(AcquireMode, Duration)> {
        self.table
            .lock()
            .leases
            .get(resource)
            .map(|record| (record.mode, record.acquired_at.elapsed()))
    }

    /// Number of held resources
    pub fn len(&self) -> usize {
        self.table.lock().leases.len()
    }

    /// True when no resource is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A lease together with the arbiter that issued it
#[derive(Debug, Clone)]
pub struct HeldLease {
    arbiter: Arc<ExclusivityArbiter>,
    lease: ArbiterLease,
}

impl HeldLease {
    /// Pair a lease with its arbiter
    pub fn new(arbiter: Arc<ExclusivityArbiter>, lease: ArbiterLease) -> Self {
        Self { arbiter, lease }
    }

    /// The underlying lease
    pub fn lease(&self) -> &ArbiterLease {
        &self.lease
    }

    /// See [`ArbiterLease::is_valid`]
    pub fn is_valid(&self) -> bool {
        self.lease.is_valid()
    }

    /// Release through the issuing arbiter
    pub fn release(&self) -> bool {
        self.arbiter.release(&self.lease)
    }
}
