//! Agent pool for multi-agent management.
//!
//! The `AgentPool` maps each capability to the agent handles that serve it
//! and enforces the global and per-capability concurrency limits. Each
//! registered handle is one worker slot: it runs at most one attempt at a
//! time.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::task::Capability;
use crate::orchestration::agent::AgentHandle;

struct Slot {
    handle: Arc<dyn AgentHandle>,
    busy: bool,
}

/// A claimed worker slot. Returned to the pool with [`AgentPool::release`].
#[derive(Clone)]
pub struct Lease {
    pub capability: Capability,
    pub slot: usize,
    pub handle: Arc<dyn AgentHandle>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("capability", &self.capability)
            .field("slot", &self.slot)
            .field("handle", &self.handle.name())
            .finish()
    }
}

/// Manages the agent handles available to a run.
///
/// # Example
///
/// ```ignore
/// let mut pool = AgentPool::new(4).with_limit(Capability::Code, 1);
/// pool.register(Arc::new(my_coder));
///
/// assert!(pool.knows(Capability::Code));
/// let lease = pool.acquire(Capability::Code).unwrap();
/// pool.release(&lease);
/// ```
pub struct AgentPool {
    slots: HashMap<Capability, Vec<Slot>>,
    /// Maximum number of attempts in flight across all capabilities.
    max_concurrent: usize,
    per_capability: HashMap<Capability, usize>,
    active: usize,
}

impl AgentPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_concurrent,
            per_capability: HashMap::new(),
            active: 0,
        }
    }

    /// Cap the number of concurrent attempts for one capability.
    pub fn with_limit(mut self, capability: Capability, limit: usize) -> Self {
        self.per_capability.insert(capability, limit);
        self
    }

    /// Add a handle as one more worker slot for its capability.
    pub fn register(&mut self, handle: Arc<dyn AgentHandle>) {
        self.slots
            .entry(handle.capability())
            .or_default()
            .push(Slot {
                handle,
                busy: false,
            });
    }

    pub fn with_agent(mut self, handle: Arc<dyn AgentHandle>) -> Self {
        self.register(handle);
        self
    }

    /// True when at least one handle serves `capability`.
    pub fn knows(&self, capability: Capability) -> bool {
        self.slots.get(&capability).is_some_and(|s| !s.is_empty())
    }

    /// Check if the global limit leaves room for another attempt.
    pub fn has_capacity(&self) -> bool {
        self.active < self.max_concurrent
    }

    /// Check if an attempt for `capability` could start right now.
    pub fn has_capacity_for(&self, capability: Capability) -> bool {
        if !self.has_capacity() {
            return false;
        }
        let limit = self.per_capability.get(&capability).copied();
        if limit.is_some_and(|limit| self.active_for(capability) >= limit) {
            return false;
        }
        self.slots
            .get(&capability)
            .is_some_and(|slots| slots.iter().any(|s| !s.busy))
    }

    /// Claim a free slot for `capability`, or `None` when none is free.
    pub fn acquire(&mut self, capability: Capability) -> Option<Lease> {
        if !self.has_capacity_for(capability) {
            return None;
        }
        let slots = self.slots.get_mut(&capability)?;
        let (index, slot) = slots.iter_mut().enumerate().find(|(_, s)| !s.busy)?;
        slot.busy = true;
        self.active += 1;
        Some(Lease {
            capability,
            slot: index,
            handle: Arc::clone(&slot.handle),
        })
    }

    /// Return a slot to the pool. Releasing a free slot is a no-op.
    pub fn release(&mut self, lease: &Lease) {
        self.release_slot(lease.capability, lease.slot);
    }

    pub(crate) fn release_slot(&mut self, capability: Capability, index: usize) {
        if let Some(slot) = self
            .slots
            .get_mut(&capability)
            .and_then(|slots| slots.get_mut(index))
        {
            if slot.busy {
                slot.busy = false;
                self.active = self.active.saturating_sub(1);
            }
        }
    }

    /// Number of attempts currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn active_for(&self, capability: Capability) -> usize {
        self.slots
            .get(&capability)
            .map(|slots| slots.iter().filter(|s| s.busy).count())
            .unwrap_or(0)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of registered handles for `capability`.
    pub fn handle_count(&self, capability: Capability) -> usize {
        self.slots.get(&capability).map(Vec::len).unwrap_or(0)
    }

    /// Capabilities with at least one handle, in a stable order.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = Capability::ALL
            .into_iter()
            .filter(|c| self.knows(*c))
            .collect();
        caps.sort();
        caps
    }

    /// A copy of this pool with every slot free, sharing the same handles.
    pub fn fresh(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|(cap, slots)| {
                let free = slots
                    .iter()
                    .map(|s| Slot {
                        handle: Arc::clone(&s.handle),
                        busy: false,
                    })
                    .collect();
                (*cap, free)
            })
            .collect();
        Self {
            slots,
            max_concurrent: self.max_concurrent,
            per_capability: self.per_capability.clone(),
            active: 0,
        }
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("capabilities", &self.capabilities())
            .field("active", &self.active)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}
