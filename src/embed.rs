//! Embedding controller: decides which comments are snapshotted into their post.
//!
//! Policy: comments are embedded in arrival order (the source streams comments
//! by id ascending) until the post holds `cap` of them or its byte budget is
//! spent. Nothing is re-sorted by score. A decision depends only on the
//! comment's identity and position in the stream, so a rerun over the same
//! source embeds the same comments.
//!
//! Per-post state is sharded by post id: each shard owns its posts' counters
//! behind its own lock, and every comment for a post lands in the same shard,
//! so no two workers ever touch one post's counter concurrently.

use crate::model::CommentDoc;
use ahash::{AHashMap, RandomState};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::hash::{BuildHasher, Hash, Hasher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmbedPolicy {
    /// Max embedded comments per post; 0 disables embedding.
    pub cap: usize,
    /// Max serialized bytes of embedded comments per post.
    pub byte_budget: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostSlot {
    pub comment_count: u64,
    pub embedded: u64,
    pub embedded_bytes: usize,
    /// Byte budget exhausted; later comments stay canonical-only.
    pub sealed: bool,
}

/// What changed for one post during one chunk. Positions and counts are
/// absolute, so applying the same delta twice leaves the post unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct PostDelta {
    pub post_id: String,
    /// Total comments seen for the post so far this run.
    pub comment_count: u64,
    /// Index in `comments` where `embedded` starts.
    pub embed_from: u64,
    pub embedded: Vec<CommentDoc>,
    /// Set when this chunk exhausted the post's byte budget.
    pub sealed_now: bool,
    /// Sealed at the end of this chunk, whether now or earlier.
    pub sealed: bool,
    /// Counters as they were before this chunk, for [`EmbeddingController::rewind_embedding`].
    pub before: PostSlot,
}

pub struct EmbeddingController {
    shards: Vec<Mutex<AHashMap<String, PostSlot>>>,
    state: RandomState,
    policy: EmbedPolicy,
}

impl EmbeddingController {
    pub fn new(policy: EmbedPolicy, shard_count: usize) -> Self {
        let count = shard_count.max(1);
        let shards = (0..count).map(|_| Mutex::new(AHashMap::new())).collect();
        // Deterministic seeds keep shard routing identical across runs.
        let state = RandomState::with_seeds(
            0x5eed_c0de_0000_0001,
            0x0ddb_a11c_afe0_f00d,
            0x7a11_0c47_e55e_1de5,
            0x0b57_ac1e_5ca1_ab1e,
        );
        Self { shards, state, policy }
    }

    pub fn policy(&self) -> EmbedPolicy {
        self.policy
    }

    #[inline]
    fn shard_index(&self, post_id: &str) -> usize {
        let mut h = self.state.build_hasher();
        post_id.hash(&mut h);
        (h.finish() as usize) % self.shards.len()
    }

    /// Current counters for a post, if any comment has been seen for it.
    pub fn slot(&self, post_id: &str) -> Option<PostSlot> {
        self.shards[self.shard_index(post_id)].lock().get(post_id).copied()
    }

    /// Number of posts with at least one comment seen.
    pub fn tracked_posts(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Admit one chunk of comments whose post reference has already been
    /// resolved. `comments` must be in arrival order; every comment must carry
    /// a `post_id`. Returns one delta per touched post, sorted by post id.
    pub fn admit(&self, comments: &[CommentDoc]) -> Vec<PostDelta> {
        let mut by_shard: Vec<Vec<&CommentDoc>> = vec![Vec::new(); self.shards.len()];
        for c in comments {
            if let Some(pid) = c.post_id.as_deref() {
                by_shard[self.shard_index(pid)].push(c);
            }
        }

        let mut deltas: Vec<PostDelta> = by_shard
            .par_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .flat_map_iter(|(i, batch)| self.admit_shard(i, batch))
            .collect();
        deltas.sort_by(|a, b| a.post_id.cmp(&b.post_id));
        deltas
    }

    fn admit_shard(&self, shard: usize, batch: &[&CommentDoc]) -> Vec<PostDelta> {
        let mut slots = self.shards[shard].lock();
        let mut order: Vec<String> = Vec::new();
        let mut pending: AHashMap<String, PostDelta> = AHashMap::new();

        for c in batch {
            let Some(pid) = c.post_id.as_deref() else { continue };
            let slot = slots.entry(pid.to_string()).or_default();
            let delta = pending.entry(pid.to_string()).or_insert_with(|| {
                order.push(pid.to_string());
                PostDelta {
                    post_id: pid.to_string(),
                    comment_count: slot.comment_count,
                    embed_from: slot.embedded,
                    embedded: Vec::new(),
                    sealed_now: false,
                    sealed: slot.sealed,
                    before: *slot,
                }
            });

            slot.comment_count += 1;
            delta.comment_count = slot.comment_count;

            if slot.sealed || slot.embedded >= self.policy.cap as u64 {
                continue;
            }
            let size = snapshot_size(c);
            if slot.embedded_bytes + size > self.policy.byte_budget {
                slot.sealed = true;
                delta.sealed_now = true;
                delta.sealed = true;
                continue;
            }
            slot.embedded += 1;
            slot.embedded_bytes += size;
            delta.embedded.push((*c).clone());
        }

        order.into_iter().filter_map(|pid| pending.remove(&pid)).collect()
    }

    /// Undo the embedding side of a delta that never reached the store.
    /// `comment_count` is kept: those comments are stored canonically, only
    /// their snapshots are lost, and later chunks may refill the freed slots.
    pub fn rewind_embedding(&self, post_id: &str, before: &PostSlot) {
        let mut slots = self.shards[self.shard_index(post_id)].lock();
        if let Some(slot) = slots.get_mut(post_id) {
            slot.embedded = before.embedded;
            slot.embedded_bytes = before.embedded_bytes;
            slot.sealed = before.sealed;
        }
    }
}

/// Encoded size of a snapshot plus its array separator.
fn snapshot_size(c: &CommentDoc) -> usize {
    serde_json::to_vec(c).map(|v| v.len() + 1).unwrap_or(usize::MAX / 2)
}
