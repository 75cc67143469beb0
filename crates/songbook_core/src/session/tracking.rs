//! Identity map and snapshot-based change tracking for one session.
//!
//! # Responsibility
//! - Hold every attached record together with its last committed snapshot.
//! - Turn staged inserts/deletes and detected field changes into a flush plan.
//! - Revert records to their snapshots on rollback.
//!
//! # Invariants
//! - At most one entry per `(table, identity)`.
//! - A handle appears in at most one entry.
//! - Snapshots of persistent entries equal the store row as of the last
//!   successful commit or load.
//! - After `revert`, no tracked entry differs from its snapshot; records that
//!   cannot be restored are detached.

use super::{Attached, SessionError, SessionResult, StateError};
use crate::model::{diff_fields, Entity, EntityMapping, Fields, Record};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

type EntryKey = u64;

#[derive(Debug)]
enum EntryState {
    /// Staged insert; `identity` is set only when the caller supplied one.
    PendingInsert { identity: Option<i64> },
    Persistent { identity: i64, snapshot: Fields },
    PendingDelete { identity: i64, snapshot: Fields },
}

struct TrackedEntry {
    record: Rc<RefCell<dyn Record>>,
    handle: Rc<dyn Any>,
    mapping: &'static EntityMapping,
    state: EntryState,
}

impl TrackedEntry {
    fn points_to(&self, ptr: *const ()) -> bool {
        Rc::as_ptr(&self.handle) as *const () == ptr
    }
}

pub(crate) struct PlannedDelete {
    pub mapping: &'static EntityMapping,
    pub identity: i64,
    key: EntryKey,
}

pub(crate) struct PlannedInsert {
    pub mapping: &'static EntityMapping,
    pub identity: Option<i64>,
    pub fields: Fields,
    key: EntryKey,
}

pub(crate) struct PlannedUpdate {
    pub mapping: &'static EntityMapping,
    pub identity: i64,
    pub changes: Fields,
    current: Fields,
    key: EntryKey,
}

/// Writes one commit has to send to the store, in flush order.
#[derive(Default)]
pub(crate) struct FlushPlan {
    pub deletes: Vec<PlannedDelete>,
    pub inserts: Vec<PlannedInsert>,
    pub updates: Vec<PlannedUpdate>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct Tracker {
    entries: BTreeMap<EntryKey, TrackedEntry>,
    by_identity: HashMap<(&'static str, i64), EntryKey>,
    next_key: EntryKey,
}

impl Tracker {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_insert_count(&self) -> usize {
        self.count(|state| matches!(state, EntryState::PendingInsert { .. }))
    }

    pub fn pending_delete_count(&self) -> usize {
        self.count(|state| matches!(state, EntryState::PendingDelete { .. }))
    }

    /// Number of persistent records whose fields differ from their snapshot.
    pub fn dirty_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| match (&entry.state, entry.record.try_borrow()) {
                (EntryState::Persistent { snapshot, .. }, Ok(record)) => {
                    !diff_fields(snapshot, &record.fields()).is_empty()
                }
                _ => false,
            })
            .count()
    }

    fn count(&self, predicate: impl Fn(&EntryState) -> bool) -> usize {
        self.entries
            .values()
            .filter(|entry| predicate(&entry.state))
            .count()
    }

    /// Returns the handle tracked for `(E, identity)`.
    ///
    /// `Ok(None)` when nothing is tracked; `NotFound` when the record is staged
    /// for deletion.
    pub fn lookup<E: Entity>(&self, identity: i64) -> SessionResult<Option<Attached<E>>> {
        let Some(key) = self.by_identity.get(&(E::MAPPING.table, identity)) else {
            return Ok(None);
        };
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if matches!(entry.state, EntryState::PendingDelete { .. }) {
            return Err(SessionError::NotFound {
                table: E::MAPPING.table,
                id: identity,
            });
        }
        let handle = Rc::clone(&entry.handle)
            .downcast::<RefCell<E>>()
            .map_err(|_| SessionError::State(StateError::TypeMismatch {
                table: E::MAPPING.table,
            }))?;
        Ok(Some(Attached::from_rc(handle)))
    }

    /// Attaches a record just read from the store.
    pub fn attach_loaded<E: Entity>(&mut self, handle: &Attached<E>, identity: i64) {
        let snapshot = handle.borrow().fields();
        let key = self.insert_entry(
            handle,
            EntryState::Persistent {
                identity,
                snapshot,
            },
        );
        self.by_identity.insert((E::MAPPING.table, identity), key);
    }

    /// Attaches a transient record as a staged insert.
    pub fn stage_insert<E: Entity>(&mut self, handle: &Attached<E>) -> SessionResult<()> {
        let identity = handle.borrow().identity();
        if let Some(id) = identity {
            if self.by_identity.contains_key(&(E::MAPPING.table, id)) {
                return Err(SessionError::State(StateError::DuplicateIdentity {
                    table: E::MAPPING.table,
                    id,
                }));
            }
        }

        let key = self.insert_entry(handle, EntryState::PendingInsert { identity });
        if let Some(id) = identity {
            self.by_identity.insert((E::MAPPING.table, id), key);
        }
        Ok(())
    }

    fn insert_entry<E: Entity>(&mut self, handle: &Attached<E>, state: EntryState) -> EntryKey {
        let key = self.next_key;
        self.next_key += 1;
        let rc = handle.rc();
        let record: Rc<RefCell<dyn Record>> = Rc::clone(rc) as Rc<RefCell<dyn Record>>;
        let any: Rc<dyn Any> = Rc::clone(rc) as Rc<dyn Any>;
        self.entries.insert(
            key,
            TrackedEntry {
                record,
                handle: any,
                mapping: E::MAPPING,
                state,
            },
        );
        key
    }

    pub fn contains<E: Entity>(&self, handle: &Attached<E>) -> bool {
        self.key_of(handle).is_some()
    }

    fn key_of<E: Entity>(&self, handle: &Attached<E>) -> Option<EntryKey> {
        let ptr = handle.as_ptr();
        self.entries
            .iter()
            .find(|(_, entry)| entry.points_to(ptr))
            .map(|(key, _)| *key)
    }

    fn attached_key<E: Entity>(&self, handle: &Attached<E>) -> SessionResult<EntryKey> {
        self.key_of(handle)
            .ok_or(SessionError::State(StateError::Detached {
                table: E::MAPPING.table,
            }))
    }

    /// Confirms the handle is attached; un-stages a pending delete.
    pub fn resubmit<E: Entity>(&mut self, handle: &Attached<E>) -> SessionResult<()> {
        let key = self.attached_key(handle)?;
        if let Some(entry) = self.entries.get_mut(&key) {
            if let EntryState::PendingDelete { identity, snapshot } = &mut entry.state {
                entry.state = EntryState::Persistent {
                    identity: *identity,
                    snapshot: std::mem::take(snapshot),
                };
            }
        }
        Ok(())
    }

    /// Stages a delete; a staged insert is simply dropped from tracking.
    pub fn stage_delete<E: Entity>(&mut self, handle: &Attached<E>) -> SessionResult<()> {
        let key = self.attached_key(handle)?;
        let Some(entry) = self.entries.get_mut(&key) else {
            return Ok(());
        };
        match &mut entry.state {
            EntryState::PendingInsert { identity } => {
                let identity = *identity;
                self.entries.remove(&key);
                if let Some(id) = identity {
                    self.by_identity.remove(&(E::MAPPING.table, id));
                }
            }
            EntryState::Persistent { identity, snapshot } => {
                entry.state = EntryState::PendingDelete {
                    identity: *identity,
                    snapshot: std::mem::take(snapshot),
                };
            }
            EntryState::PendingDelete { .. } => {}
        }
        Ok(())
    }

    /// Validates staged and modified records and collects the writes to flush.
    pub fn plan(&self) -> SessionResult<FlushPlan> {
        let mut plan = FlushPlan::default();
        for (key, entry) in &self.entries {
            // Exclusive: identities are written back into these records after commit.
            let record = entry.record.try_borrow_mut().map_err(|_| {
                SessionError::State(StateError::RecordBorrowed {
                    table: entry.mapping.table,
                })
            })?;
            let expected = match &entry.state {
                EntryState::PendingInsert { identity } => *identity,
                EntryState::Persistent { identity, .. }
                | EntryState::PendingDelete { identity, .. } => Some(*identity),
            };
            if record.identity() != expected {
                return Err(SessionError::State(StateError::IdentityChanged {
                    table: entry.mapping.table,
                    expected,
                    actual: record.identity(),
                }));
            }
            match &entry.state {
                EntryState::PendingDelete { identity, .. } => plan.deletes.push(PlannedDelete {
                    mapping: entry.mapping,
                    identity: *identity,
                    key: *key,
                }),
                EntryState::PendingInsert { identity } => {
                    record.validate()?;
                    plan.inserts.push(PlannedInsert {
                        mapping: entry.mapping,
                        identity: *identity,
                        fields: record.fields(),
                        key: *key,
                    });
                }
                EntryState::Persistent { identity, snapshot } => {
                    let current = record.fields();
                    let changes = diff_fields(snapshot, &current);
                    if changes.is_empty() {
                        continue;
                    }
                    record.validate()?;
                    plan.updates.push(PlannedUpdate {
                        mapping: entry.mapping,
                        identity: *identity,
                        changes,
                        current,
                        key: *key,
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Records a successful commit: deleted entries leave the map, inserted
    /// ones become persistent with their store identity, updated snapshots are
    /// refreshed.
    ///
    /// `assigned` holds the identity returned for each planned insert, in order.
    pub fn apply_commit(&mut self, plan: FlushPlan, assigned: &[i64]) {
        for delete in plan.deletes {
            self.entries.remove(&delete.key);
            self.by_identity.remove(&(delete.mapping.table, delete.identity));
        }

        for (insert, identity) in plan.inserts.into_iter().zip(assigned.iter().copied()) {
            let Some(entry) = self.entries.get_mut(&insert.key) else {
                continue;
            };
            if let Ok(mut record) = entry.record.try_borrow_mut() {
                record.assign_identity(Some(identity));
            }
            entry.state = EntryState::Persistent {
                identity,
                snapshot: insert.fields,
            };
            self.by_identity
                .insert((insert.mapping.table, identity), insert.key);
        }

        for update in plan.updates {
            if let Some(EntryState::Persistent { snapshot, .. }) = self
                .entries
                .get_mut(&update.key)
                .map(|entry| &mut entry.state)
            {
                *snapshot = update.current;
            }
        }
    }

    /// Discards staged work and restores every record to its snapshot.
    ///
    /// Staged inserts are detached and stay transient; staged deletes become
    /// persistent again. A record that cannot be restored (held by a caller
    /// borrow) is detached so a later commit cannot flush it. Every entry is
    /// processed even if one fails; the first failure is returned.
    pub fn revert(&mut self) -> SessionResult<()> {
        let pending: Vec<(EntryKey, &'static str, Option<i64>)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry.state {
                EntryState::PendingInsert { identity } => {
                    Some((*key, entry.mapping.table, identity))
                }
                _ => None,
            })
            .collect();
        for (key, table, identity) in pending {
            self.entries.remove(&key);
            if let Some(id) = identity {
                self.by_identity.remove(&(table, id));
            }
        }

        let mut first_error = None;
        let mut unrestored = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if let EntryState::PendingDelete { identity, snapshot } = &mut entry.state {
                entry.state = EntryState::Persistent {
                    identity: *identity,
                    snapshot: std::mem::take(snapshot),
                };
            }
            let EntryState::Persistent { identity, snapshot } = &entry.state else {
                continue;
            };
            let restored = match entry.record.try_borrow_mut() {
                Ok(mut record) => {
                    record.assign_identity(Some(*identity));
                    record.apply_fields(snapshot).map_err(SessionError::from)
                }
                Err(_) => Err(SessionError::State(StateError::RecordBorrowed {
                    table: entry.mapping.table,
                })),
            };
            if let Err(err) = restored {
                unrestored.push((*key, entry.mapping.table, *identity));
                first_error.get_or_insert(err);
            }
        }

        for (key, table, identity) in unrestored {
            self.entries.remove(&key);
            self.by_identity.remove(&(table, identity));
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Detaches every record.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_identity.clear();
    }
}
