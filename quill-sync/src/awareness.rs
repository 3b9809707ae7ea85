//! Ephemeral presence (awareness) state for a document.
//!
//! Each client advertises an opaque JSON state under a numeric client id,
//! versioned by a monotonically increasing clock. Conflicts resolve
//! last-writer-wins on the clock. The table is volatile: it is never
//! persisted, and a client's entries are explicitly removed (and the removal
//! broadcast) when its connection closes.
//!
//! Wire encoding is byte-compatible with the y-protocols awareness update:
//! `varint(n)` then n × (`varint(clientId)`, `varint(clock)`,
//! `varstring(stateJson)`), where the literal string `"null"` marks removal.

use std::collections::HashMap;

use crate::protocol::{Decoder, Encoder, ProtocolError};

/// JSON text that marks an entry as removed.
const NULL_STATE: &str = "null";

/// One client's advertised presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    /// Last-writer-wins version counter.
    pub clock: u64,
    /// Opaque JSON payload; the server never interprets it.
    pub state: String,
}

/// A decoded awareness update: a batch of (client, clock, state) records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<(u64, AwarenessEntry)>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_u64(self.entries.len() as u64);
        for (client_id, entry) in &self.entries {
            enc.write_var_u64(*client_id);
            enc.write_var_u64(entry.clock);
            enc.write_var_string(&entry.state);
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var_u64()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let client_id = dec.read_var_u64()?;
            let clock = dec.read_var_u64()?;
            let state = dec.read_var_string()?;
            entries.push((client_id, AwarenessEntry { clock, state }));
        }
        Ok(Self { entries })
    }
}

/// Per-document table of live client presence.
///
/// Removals leave a clock tombstone behind: the clock of every client ever
/// seen is kept in `clocks` even after its state is dropped, so a stale
/// in-flight update from a departed client cannot resurrect its entry.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    states: HashMap<u64, AwarenessEntry>,
    clocks: HashMap<u64, u64>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming update, last-writer-wins per client.
    ///
    /// An entry is accepted when its clock is strictly greater than the last
    /// clock recorded for that client (live or tombstoned); an equal clock is
    /// accepted only for a removal of a live entry, matching the paired
    /// y-protocols implementation so a disconnect observed by two peers
    /// cannot resurrect stale state. Returns the accepted entries, which the
    /// caller re-broadcasts to the document's other connections.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessUpdate {
        let mut accepted = Vec::new();
        for (client_id, entry) in &update.entries {
            let is_removal = entry.state == NULL_STATE;
            let known_clock = self.clocks.get(client_id).copied();
            let accept = match known_clock {
                Some(stored) => {
                    entry.clock > stored
                        || (entry.clock == stored
                            && is_removal
                            && self.states.contains_key(client_id))
                }
                None => true,
            };
            if !accept {
                continue;
            }
            self.clocks.insert(*client_id, entry.clock);
            if is_removal {
                let was_live = self.states.remove(client_id).is_some();
                if !was_live {
                    // Tombstone recorded, but peers have nothing to forget
                    continue;
                }
            } else {
                self.states.insert(*client_id, entry.clone());
            }
            accepted.push((*client_id, entry.clone()));
        }
        AwarenessUpdate { entries: accepted }
    }

    /// Drop the given clients and produce the removal update to broadcast.
    ///
    /// Clocks advance past the stored value and the tombstone keeps that
    /// clock, so the removal wins over any in-flight update from the
    /// departed client.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> AwarenessUpdate {
        let mut entries = Vec::new();
        for client_id in client_ids {
            if let Some(existing) = self.states.remove(client_id) {
                let clock = existing.clock + 1;
                self.clocks.insert(*client_id, clock);
                entries.push((
                    *client_id,
                    AwarenessEntry {
                        clock,
                        state: NULL_STATE.to_string(),
                    },
                ));
            }
        }
        AwarenessUpdate { entries }
    }

    /// Full snapshot of live entries, sent to newly attached connections.
    pub fn snapshot(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: self
                .states
                .iter()
                .map(|(id, entry)| (*id, entry.clone()))
                .collect(),
        }
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessEntry> {
        self.states.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
