//! Pending-transaction bookkeeping for one request relay.
//!
//! Every request forwarded to a worker is recorded here under its internal
//! id. The dispatcher consults the table for each worker frame to decide
//! where the frame goes and whether the transaction is finished.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use pot_wire::{Response, TransactionId};

use crate::ids::IdAllocator;

/// What a worker frame resolves to once its pending entry is found.
#[derive(Debug)]
pub enum PendingEntry {
    /// Client-originated READ/WRITE awaiting worker frames.
    External {
        /// Router identity of the issuing client.
        route: Vec<u8>,
        /// The id the client chose; restored on every outbound frame.
        original_id: TransactionId,
        /// A rewritten REP+B descriptor, held until its bulk frame arrives
        /// so the pair can be forwarded without interleaving.
        held_descriptor: Option<Vec<u8>>,
    },
    /// Proxy-originated request completed through a single-shot channel.
    Internal { reply: Sender<Response> },
}

/// Concurrency-safe map from internal transaction id to pending entry.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<TransactionId, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under a fresh id drawn from `ids`.
    ///
    /// Ids still held by long-outstanding transactions are skipped, so an
    /// allocator wrap can never alias two live transactions.
    pub fn register(&self, ids: &IdAllocator, entry: PendingEntry) -> TransactionId {
        let mut entries = self.entries.lock().expect("pending table lock poisoned");
        loop {
            let id = ids.next();
            match entries.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    return id;
                }
            }
        }
    }

    /// Removes and returns the entry for `id`.
    pub fn remove(&self, id: TransactionId) -> Option<PendingEntry> {
        self.entries
            .lock()
            .expect("pending table lock poisoned")
            .remove(&id)
    }

    /// Runs `f` on the entry for `id` without removing it.
    ///
    /// Lookup-without-remove matters because the terminal-response rule
    /// depends on the message kind.
    pub fn with_entry<T>(
        &self,
        id: TransactionId,
        f: impl FnOnce(&mut PendingEntry) -> T,
    ) -> Option<T> {
        self.entries
            .lock()
            .expect("pending table lock poisoned")
            .get_mut(&id)
            .map(f)
    }

    /// Drops every entry. Called when the backing worker goes away; clients
    /// time out on their end, internal waiters observe a closed channel.
    pub fn abandon_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("pending table lock poisoned");
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
