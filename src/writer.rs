//! Write coordinator: merged, batched, retried upserts with per-batch failure
//! isolation.

use crate::concurrency::map_limited;
use crate::error::StoreError;
use crate::model::{Collection, Document};
use crate::store::{DocumentStore, UpsertIntent};
use crate::util::retry_with_backoff;
use ahash::AHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation switch. Once set, no new chunk or batch is started.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritePolicy {
    pub batch_size: usize,
    pub max_attempts: usize,
    pub retry_delay_ms: u64,
    /// Batches in flight at once.
    pub concurrency: usize,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self { batch_size: 1000, max_attempts: 5, retry_delay_ms: 100, concurrency: 1 }
    }
}

/// Outcome of one submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Intents after duplicate-key merge.
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    pub failed_batches: u64,
    /// Failed attempts that were retried.
    pub retries: u64,
    /// Documents that had to be shrunk or were still too large.
    pub capacity_violations: u64,
    /// Of `failed`, documents rejected for size before any attempt.
    pub oversized: u64,
    /// Embedded children dropped to fit the size ceiling.
    pub shed_children: u64,
    /// Intents never attempted because the run was cancelled.
    pub skipped: u64,
    pub failed_keys: Vec<String>,
}

impl WriteReport {
    pub fn absorb(&mut self, other: WriteReport) {
        self.submitted += other.submitted;
        self.written += other.written;
        self.failed += other.failed;
        self.failed_batches += other.failed_batches;
        self.retries += other.retries;
        self.capacity_violations += other.capacity_violations;
        self.oversized += other.oversized;
        self.shed_children += other.shed_children;
        self.skipped += other.skipped;
        self.failed_keys.extend(other.failed_keys);
    }
}

pub struct WriteCoordinator<'a> {
    store: &'a dyn DocumentStore,
    policy: WritePolicy,
    cancel: CancelFlag,
}

enum BatchResult {
    Written { retries: u64 },
    Failed { retries: u64, keys: Vec<String> },
    Skipped(u64),
}

impl<'a> WriteCoordinator<'a> {
    pub fn new(store: &'a dyn DocumentStore, policy: WritePolicy, cancel: CancelFlag) -> Self {
        let policy = WritePolicy {
            batch_size: policy.batch_size.max(1),
            max_attempts: policy.max_attempts.max(1),
            concurrency: policy.concurrency.max(1),
            ..policy
        };
        Self { store, policy, cancel }
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Encode and upsert typed documents. Oversized documents shed embedded
    /// children from the tail until they fit the store's ceiling.
    pub fn upsert_docs<D: Document>(&self, docs: Vec<D>) -> WriteReport {
        let limit = self.store.max_document_bytes();
        let mut report = WriteReport::default();
        let mut intents = Vec::with_capacity(docs.len());

        for mut doc in merge_last_wins(docs, |d: &D| d.key().to_string()) {
            let mut json = match serde_json::to_string(&doc) {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!("Encoding {} `{}` failed: {}", D::COLLECTION, doc.key(), e);
                    report.failed += 1;
                    report.failed_keys.push(doc.key().to_string());
                    continue;
                }
            };
            if json.len() > limit {
                report.capacity_violations += 1;
                while json.len() > limit && doc.shed_embedded() {
                    report.shed_children += 1;
                    json = match serde_json::to_string(&doc) {
                        Ok(j) => j,
                        Err(_) => break,
                    };
                }
                if json.len() > limit {
                    tracing::warn!(
                        "{} `{}` is {} bytes after truncation (limit {}); not written",
                        D::COLLECTION,
                        doc.key(),
                        json.len(),
                        limit
                    );
                    report.failed += 1;
                    report.oversized += 1;
                    report.failed_keys.push(doc.key().to_string());
                    continue;
                }
                tracing::debug!("{} `{}` truncated to fit {} bytes", D::COLLECTION, doc.key(), limit);
            }
            intents.push(UpsertIntent { key: doc.key().to_string(), json });
        }

        let failed_before = report.failed;
        report.absorb(self.upsert_intents(D::COLLECTION, intents));
        report.submitted += failed_before;
        report
    }

    /// Upsert pre-encoded intents. Duplicate keys are merged (last wins).
    pub fn upsert_intents(&self, collection: Collection, intents: Vec<UpsertIntent>) -> WriteReport {
        let merged = merge_last_wins(intents, |i: &UpsertIntent| i.key.clone());
        let mut report = WriteReport { submitted: merged.len() as u64, ..Default::default() };
        if merged.is_empty() {
            return report;
        }

        let batches: Vec<&[UpsertIntent]> = merged.chunks(self.policy.batch_size).collect();
        let results = map_limited(&batches, self.policy.concurrency, |batch| self.write_batch(collection, batch));

        for (batch, result) in batches.iter().zip(results) {
            match result {
                BatchResult::Written { retries } => {
                    report.written += batch.len() as u64;
                    report.retries += retries;
                }
                BatchResult::Failed { retries, keys } => {
                    report.failed += keys.len() as u64;
                    report.failed_batches += 1;
                    report.retries += retries;
                    report.failed_keys.extend(keys);
                }
                BatchResult::Skipped(n) => report.skipped += n,
            }
        }
        report
    }

    fn write_batch(&self, collection: Collection, batch: &[UpsertIntent]) -> BatchResult {
        if self.cancel.is_cancelled() {
            return BatchResult::Skipped(batch.len() as u64);
        }
        let (result, attempts) = retry_with_backoff(
            self.policy.max_attempts,
            self.policy.retry_delay_ms,
            StoreError::is_transient,
            |attempt| {
                if attempt > 0 {
                    tracing::debug!("Retrying {} batch of {} (attempt {})", collection, batch.len(), attempt + 1);
                }
                self.store.upsert_many(collection, batch)
            },
        );
        let retries = (attempts - 1) as u64;
        match result {
            Ok(()) => BatchResult::Written { retries },
            Err(e) => {
                tracing::warn!(
                    "{} batch of {} failed after {} attempt(s): {}",
                    collection,
                    batch.len(),
                    attempts,
                    e
                );
                BatchResult::Failed { retries, keys: batch.iter().map(|i| i.key.clone()).collect() }
            }
        }
    }
}

/// Keep one item per key, the last submitted, at the position of its first
/// appearance.
fn merge_last_wins<T>(items: Vec<T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut slot: AHashMap<String, usize> = AHashMap::with_capacity(items.len());
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match slot.get(&key(&item)) {
            Some(&i) => out[i] = item,
            None => {
                slot.insert(key(&item), out.len());
                out.push(item);
            }
        }
    }
    out
}
