//! Arena-backed flow table with active/idle lists
//!
//! Entries live in a slab of slots addressed by generational
//! [`EntryId`]s, so a held id can never dangle: freeing a slot bumps its
//! generation and stale ids simply stop resolving. On top of the arena
//! the table threads two index-linked lists, newest-first:
//!
//! - the **active** list of flows seen recently, and
//! - the **idle** list of flows awaiting deletion.
//!
//! Because every activation or deactivation moves an entry to its list
//! head, each list is ordered by last-activity time, and the pruning
//! sweep can walk from the tail and stop at the first non-expired entry.
//! That ordering argument only holds while sweeps run more often than
//! the active timeout minus the worst clock skew; the sweep interval is
//! the caller's responsibility.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use meshcast_core::{FlowDescription, Tick, prefix_match};

use crate::entry::FibEntry;
use crate::error::{FibError, FibResult};

/// Generational handle to a flow table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Detached,
    Active,
    Idle,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<FibEntry>,
    prev: Option<u32>,
    next: Option<u32>,
    list: ListKind,
}

/// Flow lifecycle timeouts, in ticks
#[derive(Debug, Clone, Copy)]
pub struct FlowTimeouts {
    /// Active flows older than this move to the idle list
    pub active_timeout: u32,
    /// Idle flows older than this are deleted unless managed
    pub idle_timeout: u32,
}

/// Outcome of a pruning sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub deactivated: usize,
    pub deleted: usize,
}

/// The flow table: arena, exact index, and best-match lookup order
#[derive(Debug)]
pub struct FlowTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_flow: HashMap<FlowDescription, EntryId>,
    /// Entry ids with cached specificity, most specific first
    lookup_order: Vec<(EntryId, u32)>,
    active_head: Option<u32>,
    active_tail: Option<u32>,
    idle_head: Option<u32>,
    idle_tail: Option<u32>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_flow: HashMap::new(),
            lookup_order: Vec::new(),
            active_head: None,
            active_tail: None,
            idle_head: None,
            idle_tail: None,
            max_flows,
        }
    }

    pub fn len(&self) -> usize {
        self.by_flow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_flow.is_empty()
    }

    /// Insert a new entry, detached from both lists
    ///
    /// Fails with [`FibError::TableFull`] at capacity. Inserting a flow
    /// that already has an entry replaces the entry in place and keeps
    /// its id and list position.
    pub fn insert(&mut self, entry: FibEntry) -> FibResult<EntryId> {
        if let Some(&id) = self.by_flow.get(entry.flow()) {
            self.slots[id.index as usize].entry = Some(entry);
            return Ok(id);
        }
        if self.by_flow.len() >= self.max_flows {
            return Err(FibError::TableFull {
                max: self.max_flows,
            });
        }

        let flow = entry.flow().clone();
        let specificity = flow.specificity();
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                slot.prev = None;
                slot.next = None;
                slot.list = ListKind::Detached;
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                    prev: None,
                    next: None,
                    list: ListKind::Detached,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let id = EntryId {
            index,
            generation: self.slots[index as usize].generation,
        };
        self.by_flow.insert(flow, id);
        let position = self
            .lookup_order
            .partition_point(|(_, weight)| *weight > specificity);
        self.lookup_order.insert(position, (id, specificity));
        trace!(id = ?id, flows = self.by_flow.len(), "inserted flow entry");
        Ok(id)
    }

    pub fn get(&self, id: EntryId) -> Option<&FibEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut FibEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Exact-key lookup
    pub fn find_exact(&self, flow: &FlowDescription) -> Option<EntryId> {
        self.by_flow.get(flow).copied()
    }

    /// Best-prefix lookup, walking candidates most-specific first
    pub fn find_best_match(&self, query: &FlowDescription) -> Option<EntryId> {
        for (id, _) in &self.lookup_order {
            let Some(entry) = self.get(*id) else { continue };
            if entry.flow().matches(query) {
                // A matched entry must cover the queried destination; a
                // violation means the table ordering is corrupt.
                if !prefix_match(&entry.flow().dst, &query.dst, entry.flow().dst_prefix) {
                    warn!(
                        query = %query,
                        matched = %entry.flow(),
                        "best-match returned an entry for a different destination"
                    );
                    debug_assert!(false, "flow table lookup inconsistency");
                }
                return Some(*id);
            }
        }
        None
    }

    /// Remove an entry and return it; stale ids remove nothing
    pub fn remove(&mut self, id: EntryId) -> Option<FibEntry> {
        self.get(id)?;
        self.unlink(id.index);
        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_flow.remove(entry.flow());
        self.lookup_order.retain(|(other, _)| *other != id);
        self.free.push(id.index);
        trace!(flow = %entry.flow(), "removed flow entry");
        Some(entry)
    }

    /// Activate a flow and move it to the active list head
    pub fn activate_flow(&mut self, id: EntryId, now: Tick) -> FibResult<()> {
        let entry = self.get_mut(id).ok_or(FibError::StaleEntryId)?;
        entry.activate(now);
        debug!(flow = %entry.flow(), "flow activated");
        self.unlink(id.index);
        self.push_front(id.index, ListKind::Active);
        Ok(())
    }

    /// Move a flow from the active to the idle list
    pub fn deactivate_flow(&mut self, id: EntryId, now: Tick) -> FibResult<()> {
        let entry = self.get_mut(id).ok_or(FibError::StaleEntryId)?;
        entry.deactivate(now);
        debug!(flow = %entry.flow(), "flow deactivated");
        self.unlink(id.index);
        self.push_front(id.index, ListKind::Idle);
        Ok(())
    }

    /// Sweep both lists from their tails
    ///
    /// Active flows past `active_timeout` are demoted to the idle list;
    /// idle flows past `idle_timeout` are deleted unless managed. The
    /// walk stops at the first non-expired entry, relying on each list
    /// being ordered by last-activity time.
    pub fn prune(&mut self, timeouts: FlowTimeouts, now: Tick) -> PruneStats {
        let mut stats = PruneStats::default();

        loop {
            let Some(index) = self.active_tail else { break };
            let id = self.id_at(index);
            let Some(entry) = self.slots[index as usize].entry.as_mut() else {
                break;
            };
            if entry.age(now) < timeouts.active_timeout {
                break;
            }
            if self.deactivate_flow(id, now).is_err() {
                break;
            }
            stats.deactivated += 1;
        }

        let mut cursor = self.idle_tail;
        while let Some(index) = cursor {
            let id = self.id_at(index);
            let Some(entry) = self.slots[index as usize].entry.as_mut() else {
                break;
            };
            if entry.age(now) < timeouts.idle_timeout {
                break;
            }
            let managed = entry.is_managed();
            cursor = self.slots[index as usize].prev;
            if managed {
                continue;
            }
            self.remove(id);
            stats.deleted += 1;
        }

        if stats.deactivated > 0 || stats.deleted > 0 {
            debug!(
                deactivated = stats.deactivated,
                deleted = stats.deleted,
                "flow prune sweep"
            );
        }
        stats
    }

    /// Entry ids on the active list, newest first
    pub fn active_flows(&self) -> Vec<EntryId> {
        self.collect_list(self.active_head)
    }

    /// Entry ids on the idle list, newest first
    pub fn idle_flows(&self) -> Vec<EntryId> {
        self.collect_list(self.idle_head)
    }

    /// Iterate all live entries with their ids
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &FibEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            Some((
                EntryId {
                    index: index as u32,
                    generation: slot.generation,
                },
                entry,
            ))
        })
    }

    fn id_at(&self, index: u32) -> EntryId {
        EntryId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn collect_list(&self, head: Option<u32>) -> Vec<EntryId> {
        let mut ids = Vec::new();
        let mut cursor = head;
        while let Some(index) = cursor {
            ids.push(self.id_at(index));
            cursor = self.slots[index as usize].next;
        }
        ids
    }

    fn unlink(&mut self, index: u32) {
        let slot = &self.slots[index as usize];
        let (prev, next, list) = (slot.prev, slot.next, slot.list);
        if list == ListKind::Detached {
            return;
        }
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => match list {
                ListKind::Active => self.active_head = next,
                ListKind::Idle => self.idle_head = next,
                ListKind::Detached => {}
            },
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => match list {
                ListKind::Active => self.active_tail = prev,
                ListKind::Idle => self.idle_tail = prev,
                ListKind::Detached => {}
            },
        }
        let slot = &mut self.slots[index as usize];
        slot.prev = None;
        slot.next = None;
        slot.list = ListKind::Detached;
    }

    fn push_front(&mut self, index: u32, list: ListKind) {
        let head = match list {
            ListKind::Active => self.active_head,
            ListKind::Idle => self.idle_head,
            ListKind::Detached => return,
        };
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = None;
            slot.next = head;
            slot.list = list;
        }
        if let Some(h) = head {
            self.slots[h as usize].prev = Some(index);
        }
        match list {
            ListKind::Active => {
                self.active_head = Some(index);
                if self.active_tail.is_none() {
                    self.active_tail = Some(index);
                }
            }
            ListKind::Idle => {
                self.idle_head = Some(index);
                if self.idle_tail.is_none() {
                    self.idle_tail = Some(index);
                }
            }
            ListKind::Detached => {}
        }
    }
}
