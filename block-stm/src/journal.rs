//! Snapshot/revert journal for a single transaction attempt.
//!
//! [`JournaledState`] owns a transaction's working branch, its journal of undo
//! entries and its auxiliary event log. Sub-operations that may fail open a
//! snapshot first; on failure the journal is unwound back to that snapshot,
//! restoring buffered writes and dropping the events the sub-operation emitted.

use crate::error::{Result, StmError};
use crate::store::{BranchStore, Changeset, KvRead, KvStore, ViewId, WriteBuffer};
use crate::types::{Key, StoreKey, Value};

/// An auxiliary log record emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Handle to an entry on the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalId(u64);

/// One undo point on the journal.
#[derive(Debug, Clone)]
pub enum JournalEntry {
    /// Captured working state before a nested sub-operation.
    Checkpoint {
        buffer: WriteBuffer,
        /// Event log length at capture time.
        events: usize,
    },
    /// A single key written through the journaled state.
    KeyWrite {
        key: Key,
        /// The key's buffered entry before the write; `None` if it had none.
        prev: Option<Option<Value>>,
    },
    /// A bulk write that bypassed per-key journaling.
    NativeChange {
        buffer: WriteBuffer,
        /// Position of the first event the change emitted.
        first_event: usize,
        /// Number of events the change emitted.
        events: usize,
    },
}

impl JournalEntry {
    fn revert<P: KvRead + ?Sized>(
        self,
        working: &mut BranchStore<'_, P>,
        log: &mut Vec<Event>,
    ) -> Result<()> {
        match self {
            JournalEntry::Checkpoint { buffer, events } => {
                if events > log.len() {
                    return Err(StmError::invariant(format!(
                        "checkpoint recorded {} events but log holds {}",
                        events,
                        log.len()
                    )));
                }
                working.restore(buffer);
                log.truncate(events);
            }
            JournalEntry::KeyWrite { key, prev } => {
                working.restore_key(key, prev);
            }
            JournalEntry::NativeChange {
                buffer,
                first_event,
                events,
            } => {
                let end = first_event + events;
                if end > log.len() {
                    return Err(StmError::invariant(format!(
                        "native change emitted events {}..{} but log holds {}",
                        first_event,
                        end,
                        log.len()
                    )));
                }
                working.restore(buffer);
                log.drain(first_event..end);
            }
        }
        Ok(())
    }
}

/// Ordered undo stack. Ids increase monotonically and are never reused.
#[derive(Debug, Default)]
pub struct Journal {
    next_id: u64,
    entries: Vec<(JournalId, JournalEntry)>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: JournalId) -> bool {
        self.position(id).is_ok()
    }

    pub fn push(&mut self, entry: JournalEntry) -> JournalId {
        let id = JournalId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, entry));
        id
    }

    fn position(&self, id: JournalId) -> Result<usize> {
        self.entries
            .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
            .map_err(|_| StmError::invariant(format!("journal entry {:?} already popped", id)))
    }

    /// Pops every entry from `id` to the top, oldest first.
    fn pop_to(&mut self, id: JournalId) -> Result<Vec<JournalEntry>> {
        let pos = self.position(id)?;
        Ok(self
            .entries
            .split_off(pos)
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn remove(&mut self, id: JournalId) -> Result<JournalEntry> {
        let pos = self.position(id)?;
        Ok(self.entries.remove(pos).1)
    }
}

/// A transaction's working state: branch, journal and event log.
pub struct JournaledState<'a, P: KvRead + ?Sized> {
    working: BranchStore<'a, P>,
    journal: Journal,
    events: Vec<Event>,
}

impl<'a, P: KvRead + ?Sized> JournaledState<'a, P> {
    /// Starts a fresh journaled state branched off `parent`.
    pub fn new(parent: &'a P) -> Self {
        Self {
            working: BranchStore::new(parent),
            journal: Journal::new(),
            events: Vec::new(),
        }
    }

    pub fn set(&mut self, key: Key, value: Value) {
        self.journal_key(&key);
        self.working.set(key, value);
    }

    pub fn delete(&mut self, key: &Key) {
        self.journal_key(key);
        self.working.delete(key);
    }

    fn journal_key(&mut self, key: &Key) {
        // Nothing to undo back to while no entry is open.
        if !self.journal.is_empty() {
            let prev = self.working.buffered(key);
            self.journal.push(JournalEntry::KeyWrite {
                key: key.clone(),
                prev,
            });
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn journal_depth(&self) -> usize {
        self.journal.len()
    }

    /// Captures the working state and event count.
    pub fn snapshot(&mut self) -> JournalId {
        self.journal.push(JournalEntry::Checkpoint {
            buffer: self.working.buffer().clone(),
            events: self.events.len(),
        })
    }

    /// Unwinds every entry from the top of the journal down to and including `id`.
    pub fn revert_to(&mut self, id: JournalId) -> Result<()> {
        let entries = self.journal.pop_to(id)?;
        tracing::trace!(?id, unwound = entries.len(), "reverting journal");
        for entry in entries.into_iter().rev() {
            entry.revert(&mut self.working, &mut self.events)?;
        }
        Ok(())
    }

    /// Drops `id` without undoing it. Later entries stay on the journal.
    pub fn discard(&mut self, id: JournalId) -> Result<()> {
        self.journal.remove(id).map(drop)
    }

    /// Runs a bulk operation directly against the working branch.
    ///
    /// On success a [`JournalEntry::NativeChange`] is recorded so an enclosing
    /// revert can undo it. On failure the operation is undone immediately.
    pub fn native_change<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut BranchStore<'a, P>, &mut Vec<Event>) -> std::result::Result<T, E>,
    {
        let buffer = self.working.buffer().clone();
        let first_event = self.events.len();

        match f(&mut self.working, &mut self.events) {
            Ok(value) => {
                let events = self.events.len().saturating_sub(first_event);
                self.journal.push(JournalEntry::NativeChange {
                    buffer,
                    first_event,
                    events,
                });
                Ok(value)
            }
            Err(err) => {
                self.working.restore(buffer);
                self.events.truncate(first_event);
                Err(err)
            }
        }
    }

    /// Ends the transaction, returning its writes and event log.
    pub fn finish(self) -> (Changeset, Vec<Event>) {
        (self.working.into_changeset(), self.events)
    }
}

impl<P: KvRead + ?Sized> KvRead for JournaledState<'_, P> {
    fn get(&self, key: &Key) -> Option<Value> {
        self.working.get(key)
    }

    fn scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        self.working.scan(store, prefix)
    }

    fn stores(&self) -> Vec<StoreKey> {
        self.working.stores()
    }

    fn view_id(&self) -> ViewId {
        self.working.view_id()
    }
}
