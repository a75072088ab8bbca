//! Peer stores — the TTL-evicting `topic → peers` collections.
//!
//! One instance holds discovered/announced peers, a second holds push
//! subscribers. Entries keep insertion order per topic; the size cap is
//! global across topics and evicts the oldest entry anywhere. Reads sample
//! uniformly at random so early-inserted peers get no extra traffic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use beacon_core::wire::{Peer, Topic, PACKED_PEER_LEN};
use rand::Rng;

struct Entry {
    peer: Peer,
    /// Cached wire form, written once at insert.
    packed: [u8; PACKED_PEER_LEN],
    seen: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<Topic, Vec<Entry>>,
    len: usize,
    seq: u64,
}

/// Bounded, TTL-evicting `(topic → ordered set of peers)` collection.
pub struct PeerStore {
    /// Entry lifetime. Zero disables expiration.
    ttl: Duration,
    /// Total peer cap across all topics. Zero disables the cap.
    limit: usize,
    inner: Mutex<Inner>,
}

impl PeerStore {
    pub fn new(ttl: Duration, limit: usize) -> Self {
        Self {
            ttl,
            limit,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert `(topic, peer)`. Returns true iff the tuple was not already
    /// present; a duplicate refreshes its timestamp but keeps its position.
    /// At the cap, the globally oldest entry is evicted first.
    pub fn add(&self, topic: &Topic, peer: Peer) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let now = Instant::now();

        if let Some(entries) = inner.topics.get_mut(topic) {
            if let Some(entry) = entries.iter_mut().find(|e| e.peer == peer) {
                entry.seen = now;
                return false;
            }
        }

        if self.limit > 0 && inner.len >= self.limit {
            evict_oldest(inner);
        }

        let seq = inner.seq;
        inner.seq += 1;
        inner.topics.entry(topic.clone()).or_default().push(Entry {
            peer,
            packed: peer.pack(),
            seen: now,
            seq,
        });
        inner.len += 1;
        true
    }

    /// Remove the exact tuple. No-op if absent.
    pub fn remove(&self, topic: &Topic, peer: Peer) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(entries) = inner.topics.get_mut(topic) {
            let before = entries.len();
            entries.retain(|e| e.peer != peer);
            let removed = before - entries.len();
            inner.len -= removed;
            if entries.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }

    /// Up to `max` peers for `topic`, sampled uniformly without replacement.
    pub fn get(&self, topic: &Topic, max: usize) -> Vec<Peer> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.purge_expired(inner, topic);
        match inner.topics.get(topic) {
            Some(entries) => sample_indices(entries.len(), max)
                .into_iter()
                .map(|i| entries[i].peer)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Like [`get`](Self::get), but returns the concatenated wire form,
    /// using each entry's cached encoding.
    pub fn get_packed(&self, topic: &Topic, max: usize) -> Vec<u8> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.purge_expired(inner, topic);
        match inner.topics.get(topic) {
            Some(entries) => {
                let indices = sample_indices(entries.len(), max);
                let mut out = Vec::with_capacity(indices.len() * PACKED_PEER_LEN);
                for i in indices {
                    out.extend_from_slice(&entries[i].packed);
                }
                out
            }
            None => Vec::new(),
        }
    }

    /// Full traversal in insertion order, topics sorted, for JSON export.
    pub fn iterate(&self) -> Vec<(Topic, Vec<Peer>)> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let topics: Vec<Topic> = inner.topics.keys().cloned().collect();
        for topic in &topics {
            self.purge_expired(inner, topic);
        }
        let mut out: Vec<(Topic, Vec<Peer>)> = inner
            .topics
            .iter()
            .map(|(topic, entries)| (topic.clone(), entries.iter().map(|e| e.peer).collect()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries for `topic` older than the TTL. Expiration is lazy —
    /// reads are regular enough that no background sweep is needed.
    fn purge_expired(&self, inner: &mut Inner, topic: &Topic) {
        if self.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        if let Some(entries) = inner.topics.get_mut(topic) {
            let before = entries.len();
            entries.retain(|e| now.duration_since(e.seen) < self.ttl);
            inner.len -= before - entries.len();
            if entries.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }
}

fn evict_oldest(inner: &mut Inner) {
    let mut oldest: Option<(Topic, usize, u64)> = None;
    for (topic, entries) in &inner.topics {
        for (i, entry) in entries.iter().enumerate() {
            if oldest.as_ref().map_or(true, |(_, _, seq)| entry.seq < *seq) {
                oldest = Some((topic.clone(), i, entry.seq));
            }
        }
    }
    if let Some((topic, i, _)) = oldest {
        if let Some(entries) = inner.topics.get_mut(&topic) {
            entries.remove(i);
            inner.len -= 1;
            if entries.is_empty() {
                inner.topics.remove(&topic);
            }
        }
    }
}

/// Pick `max` of `len` indices uniformly without replacement — a partial
/// Fisher-Yates so the head of the insertion order carries no bias.
fn sample_indices(len: usize, max: usize) -> Vec<usize> {
    let n = max.min(len);
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = rand::thread_rng();
    for i in 0..n {
        let j = rng.gen_range(i..len);
        indices.swap(i, j);
    }
    indices.truncate(n);
    indices
}
