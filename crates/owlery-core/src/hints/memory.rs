//! In-memory hint database.
//!
//! The structure is a relay serial table (URL to dense id, append-only)
//! plus one record per user holding that user's relay entries sorted by
//! descending score. Keeping the order on every write makes `top_n` a
//! plain prefix copy.
//!
//! # Scoring
//!
//! A relay entry holds one timestamp per hint purpose. Against the user's
//! `oldest` base timestamp, each non-zero slot contributes
//!
//! - `base_points` when the slot equals the base
//! - `base_points / 2` when it is older than the base
//! - `base_points * ts / 30d` when it is newer
//!
//! so the most recent observations dominate regardless of purpose, and
//! anything older than the base still counts at half weight. All of it is
//! integer arithmetic.

use std::collections::HashMap;
use std::sync::Arc;

use nostr::Timestamp;
use parking_lot::RwLock;

use super::{HintPurpose, HintsDatabase, PURPOSE_COUNT};
use crate::clock::{Clock, SystemClock};

/// Observations older than this many seconds are ignored when lowering a
/// user's `oldest` base.
const STALE_AFTER_SECS: u64 = 60 * 60 * 24 * 180;

/// Divisor applied to newer-than-base timestamps, in seconds.
const RECENCY_DIVISOR: i64 = 60 * 60 * 24 * 30;

/// Number of per-user lock shards, keyed by the first byte of the pubkey.
const SHARD_COUNT: usize = 16;

/// One (user, relay) pairing: the relay's serial and a timestamp per
/// purpose, zero meaning "never observed for this purpose".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RelayEntry {
    serial: u32,
    timestamps: [u64; PURPOSE_COUNT],
}

impl RelayEntry {
    fn new(serial: u32) -> Self {
        Self {
            serial,
            timestamps: [0; PURPOSE_COUNT],
        }
    }

    /// Score against the user-wide `oldest` base.
    fn sum(&self, oldest: u64) -> i64 {
        let mut sum = 0i64;
        for (i, &ts) in self.timestamps.iter().enumerate() {
            if ts == 0 {
                continue;
            }
            let base = HintPurpose::ALL[i].base_points();
            let value = if ts == oldest {
                base
            } else if ts < oldest {
                base / 2
            } else {
                base * ts as i64 / RECENCY_DIVISOR
            };
            sum += value;
        }
        sum
    }
}

/// Per-user record: the score base and the ordered relay entries.
#[derive(Debug, Clone, Default)]
struct RelaysForPubKey {
    /// Smallest usable observation timestamp for this user, `now` at
    /// first observation.
    oldest: u64,
    /// Entries sorted by descending `sum(oldest)`, uniquely keyed by
    /// relay serial.
    entries: Vec<RelayEntry>,
}

/// Append-only URL to serial mapping. Serials never shift and a URL maps
/// to at most one serial for the life of the store.
#[derive(Debug, Default)]
struct SerialTable {
    by_serial: Vec<String>,
    by_url: HashMap<String, u32>,
}

impl SerialTable {
    fn resolve_or_insert(&mut self, url: &str) -> u32 {
        if let Some(&serial) = self.by_url.get(url) {
            return serial;
        }
        let serial = self.by_serial.len() as u32;
        self.by_serial.push(url.to_string());
        self.by_url.insert(url.to_string(), serial);
        serial
    }

    fn url(&self, serial: u32) -> &str {
        &self.by_serial[serial as usize]
    }
}

/// In-memory [`HintsDatabase`].
///
/// Entries live for the process lifetime; there is no eviction. Writes
/// are serialized per user through a sharded lock pool so a concurrent
/// reader always sees a fully ordered list.
pub struct MemoryHintsDb {
    relays: RwLock<SerialTable>,
    shards: Vec<RwLock<HashMap<String, RelaysForPubKey>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryHintsDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHintsDb {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Build a database with a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            relays: RwLock::new(SerialTable::default()),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            clock,
        }
    }

    fn shard(&self, pubkey: &str) -> &RwLock<HashMap<String, RelaysForPubKey>> {
        let byte = pubkey.as_bytes().first().copied().unwrap_or(0);
        &self.shards[byte as usize % SHARD_COUNT]
    }
}

impl HintsDatabase for MemoryHintsDb {
    fn save(&self, pubkey: &str, relay_url: &str, purpose: HintPurpose, ts: Timestamp) {
        let ts = ts.as_u64();
        let now = self.clock.now();
        let threshold = now.saturating_sub(STALE_AFTER_SECS);

        let serial = self.relays.write().resolve_or_insert(relay_url);

        let mut shard = self.shard(pubkey).write();
        let rfpk = shard.entry(pubkey.to_string()).or_default();

        if rfpk.oldest == 0 {
            rfpk.oldest = now;
        }

        let mut prev_score = 0i64;
        let mut entry_index = match rfpk.entries.iter().position(|e| e.serial == serial) {
            Some(i) => {
                if rfpk.entries[i].timestamps[purpose.index()] < ts {
                    // capture the score before the update so we know which
                    // way to reposition
                    prev_score = rfpk.entries[i].sum(rfpk.oldest);
                    rfpk.entries[i].timestamps[purpose.index()] = ts;
                    i
                } else {
                    return;
                }
            }
            None => {
                let mut entry = RelayEntry::new(serial);
                entry.timestamps[purpose.index()] = ts;
                rfpk.entries.push(entry);
                rfpk.entries.len() - 1
            }
        };

        if ts > threshold && ts < rfpk.oldest {
            // the base moved, every score changes: sort from scratch
            rfpk.oldest = ts;
            let oldest = rfpk.oldest;
            rfpk.entries.sort_by(|a, b| b.sum(oldest).cmp(&a.sum(oldest)));
        } else {
            // the base is unchanged, only one entry moved: bubble it into
            // place with adjacent swaps
            let new_score = rfpk.entries[entry_index].sum(rfpk.oldest);
            let dir: isize = if new_score > prev_score { -1 } else { 1 };
            loop {
                let next_index = entry_index as isize + dir;
                if next_index < 0 || next_index as usize >= rfpk.entries.len() {
                    break;
                }
                let next_index = next_index as usize;
                let next_score = rfpk.entries[next_index].sum(rfpk.oldest);
                let out_of_order = (dir == -1 && next_score < new_score)
                    || (dir == 1 && next_score > new_score);
                if out_of_order {
                    rfpk.entries.swap(entry_index, next_index);
                    entry_index = next_index;
                } else {
                    break;
                }
            }
        }
    }

    fn top_n(&self, pubkey: &str, n: usize) -> Vec<String> {
        let mut urls = Vec::with_capacity(n);
        let shard = self.shard(pubkey).read();
        if let Some(rfpk) = shard.get(pubkey) {
            let relays = self.relays.read();
            for entry in rfpk.entries.iter().take(n) {
                urls.push(relays.url(entry.serial).to_string());
            }
        }
        urls
    }

    fn print_scores(&self) {
        let relays = self.relays.read();
        for shard in &self.shards {
            for (pubkey, rfpk) in shard.read().iter() {
                tracing::info!("relay scores for {}", pubkey);
                for (i, entry) in rfpk.entries.iter().enumerate() {
                    tracing::info!(
                        "  {:3} :: {:30} ({:3}) ::> {:12}",
                        i,
                        relays.url(entry.serial),
                        entry.serial,
                        entry.sum(rfpk.oldest)
                    );
                }
            }
        }
    }
}
