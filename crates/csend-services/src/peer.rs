//! Peer table: fixed-capacity registry of peers seen on the LAN.
//!
//! Records live in a slot table. A slot is never removed, only marked
//! inactive, and the lowest free slot is reused first so that the 1-based
//! indices shown to the user stay short.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One row of the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub display_name: String,
    /// Last time any frame arrived from this peer.
    pub last_seen: Instant,
    pub active: bool,
}

/// Outcome of a successful [`PeerTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A slot was populated for a previously unknown (or expired) peer.
    Added,
    /// An active record was refreshed.
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerTableError {
    #[error("peer table full ({capacity} slots)")]
    Full { capacity: usize },
}

/// The peer table shared between tasks in the threaded model.
/// Lock it for one operation at a time, never across a network call.
pub type SharedPeerTable = Arc<Mutex<PeerTable>>;

#[derive(Debug)]
pub struct PeerTable {
    slots: Vec<Option<PeerRecord>>,
    /// Slots with no active record, lowest first.
    free: BTreeSet<usize>,
    /// Active address → slot.
    index: HashMap<IpAddr, usize>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            free: (0..capacity).collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn shared(capacity: usize) -> SharedPeerTable {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record a sighting of `address`.
    ///
    /// An active record gets its `last_seen` refreshed and, when
    /// `display_name` is non-empty, its name overwritten. Otherwise the
    /// lowest free slot is populated. With no free slot the sighting is
    /// dropped.
    pub fn upsert(
        &mut self,
        address: IpAddr,
        display_name: &str,
        now: Instant,
    ) -> Result<Upsert, PeerTableError> {
        if let Some(record) = self
            .index
            .get(&address)
            .and_then(|&slot| self.slots[slot].as_mut())
        {
            record.last_seen = now;
            if !display_name.is_empty() {
                record.display_name = display_name.to_string();
            }
            return Ok(Upsert::Updated);
        }

        let slot = self.free.pop_first().ok_or(PeerTableError::Full {
            capacity: self.capacity(),
        })?;
        self.slots[slot] = Some(PeerRecord {
            address,
            display_name: display_name.to_string(),
            last_seen: now,
            active: true,
        });
        self.index.insert(address, slot);
        tracing::debug!(peer = %address, name = display_name, slot, "peer added");
        Ok(Upsert::Added)
    }

    /// Mark `address` inactive. Returns whether a record changed.
    pub fn deactivate(&mut self, address: IpAddr) -> bool {
        match self.index.remove(&address) {
            Some(slot) => {
                self.release(slot);
                tracing::debug!(peer = %address, "peer deactivated");
                true
            }
            None => false,
        }
    }

    /// Deactivate every record not seen within `timeout`. Returns how many
    /// records expired.
    pub fn prune_expired(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<(IpAddr, usize)> = self
            .index
            .iter()
            .filter(|(_, &slot)| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|r| now.saturating_duration_since(r.last_seen) > timeout)
            })
            .map(|(&addr, &slot)| (addr, slot))
            .collect();

        for (addr, slot) in &expired {
            self.index.remove(addr);
            self.release(*slot);
            tracing::debug!(peer = %addr, "peer timed out");
        }
        expired.len()
    }

    /// Active records in slot order.
    pub fn list_active(&self) -> Vec<PeerRecord> {
        self.active_records().cloned().collect()
    }

    /// Look up an active peer by its 1-based position in [`list_active`].
    /// Indices are only meaningful until the next mutation.
    ///
    /// [`list_active`]: PeerTable::list_active
    pub fn get_by_index(&self, index: usize) -> Option<PeerRecord> {
        index
            .checked_sub(1)
            .and_then(|i| self.active_records().nth(i))
            .cloned()
    }

    pub fn get(&self, address: IpAddr) -> Option<&PeerRecord> {
        self.index
            .get(&address)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn active_count(&self) -> usize {
        self.index.len()
    }

    fn active_records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.iter().flatten().filter(|r| r.active)
    }

    fn release(&mut self, slot: usize) {
        if let Some(record) = self.slots[slot].as_mut() {
            record.active = false;
        }
        self.free.insert(slot);
    }
}
