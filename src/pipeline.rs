//! Dependency orchestrator: runs the entity streams parents-first, resolves
//! references against what is already stored, and drives the run's state
//! machine.

use crate::audit::{audit, AuditReport};
use crate::config::{MigrateOptions, TargetSpec};
use crate::embed::{EmbedPolicy, EmbeddingController, PostDelta};
use crate::error::{ErrorClass, FatalError, RowValidationError, StoreError};
use crate::indexes::{ensure_standard_indexes, IndexReport};
use crate::layout::SourceLayout;
use crate::mapper::{map_comment, map_moderation, map_post, map_subreddit, map_user, ModerationRecord};
use crate::model::{Collection, CommentDoc, Document, EntityKind, ModerationDoc, PostDoc, TargetKind};
use crate::progress::StageProgress;
use crate::source::{RawRow, SourceReader};
use crate::sqlite_store::SqliteDocStore;
use crate::stats::RunStats;
use crate::store::{DocumentStore, MemoryStore};
use crate::thing::{ParentRef, TargetRef};
use crate::util::{create_with_backoff, init_tracing_once, replace_file_atomic_backoff, retry_with_backoff};
use crate::writer::{CancelFlag, WriteCoordinator, WritePolicy, WriteReport};
use ahash::{AHashMap, AHashSet};
use anyhow::Context;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Headroom kept for a post's own fields when sizing its embedded comments.
const POST_ENVELOPE_BYTES: usize = 64 * 1024;
/// Integrity violations logged individually before switching to a summary.
const LOGGED_VIOLATIONS: u64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "entity", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Reading(EntityKind),
    Mapping(EntityKind),
    /// Comments only.
    Embedding,
    Writing(EntityKind),
    Indexing,
    Done,
    /// Reached only from a fatal configuration error.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Moderation rows were dropped because a reference did not resolve.
    CompletedWithIntegrityErrors,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub cancelled: bool,
    pub stats: RunStats,
    /// States in the order first entered.
    pub trace: Vec<PipelineState>,
    pub indexes: Vec<IndexReport>,
    pub collection_counts: BTreeMap<Collection, u64>,
    pub audit: Option<AuditReport>,
    pub elapsed_ms: u128,
}

#[derive(Clone)]
pub struct RedditMigration {
    pub(crate) opts: MigrateOptions,
    cancel: CancelFlag,
}

impl Default for RedditMigration {
    fn default() -> Self {
        Self::new()
    }
}

impl RedditMigration {
    pub fn new() -> Self {
        Self { opts: MigrateOptions::default(), cancel: CancelFlag::new() }
    }

    pub fn from_options(opts: MigrateOptions) -> Self {
        Self { opts, cancel: CancelFlag::new() }
    }

    // -------- Builder methods --------
    pub fn source(mut self, path: impl AsRef<Path>) -> Self { self.opts = self.opts.with_source(path); self }
    pub fn layout(mut self, layout: SourceLayout) -> Self { self.opts = self.opts.with_layout(layout); self }
    pub fn target(mut self, target: TargetSpec) -> Self { self.opts = self.opts.with_target(target); self }
    pub fn chunk_size(mut self, n: usize) -> Self { self.opts = self.opts.with_chunk_size(n); self }
    pub fn embed_cap(mut self, cap: usize) -> Self { self.opts = self.opts.with_embed_cap(cap); self }
    pub fn reset(mut self, yes: bool) -> Self { self.opts = self.opts.with_reset(yes); self }
    pub fn limit(mut self, limit: Option<u64>) -> Self { self.opts = self.opts.with_limit(limit); self }
    pub fn batch_size(mut self, n: usize) -> Self { self.opts = self.opts.with_batch_size(n); self }
    pub fn write_attempts(mut self, n: usize) -> Self { self.opts = self.opts.with_write_attempts(n); self }
    pub fn retry_delay_ms(mut self, ms: u64) -> Self { self.opts = self.opts.with_retry_delay_ms(ms); self }
    pub fn write_concurrency(mut self, n: usize) -> Self { self.opts = self.opts.with_write_concurrency(n); self }
    pub fn read_attempts(mut self, n: usize) -> Self { self.opts = self.opts.with_read_attempts(n); self }
    pub fn shard_count(mut self, n: usize) -> Self { self.opts = self.opts.with_shard_count(n); self }
    pub fn parallelism(mut self, threads: usize) -> Self { self.opts = self.opts.with_parallelism(threads); self }
    pub fn max_document_bytes(mut self, bytes: usize) -> Self { self.opts = self.opts.with_max_document_bytes(bytes); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn stats_path(mut self, path: impl AsRef<Path>) -> Self { self.opts = self.opts.with_stats_path(path); self }
    pub fn audit(mut self, yes: bool) -> Self { self.opts = self.opts.with_audit(yes); self }
    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self { self.cancel = flag; self }

    pub fn options(&self) -> &MigrateOptions {
        &self.opts
    }

    /// Handle that stops the run from another thread.
    pub fn canceller(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Open the configured target.
    pub fn open_store(&self) -> Result<Box<dyn DocumentStore>, FatalError> {
        Ok(match &self.opts.target {
            TargetSpec::Memory => {
                let store = MemoryStore::new();
                Box::new(match self.opts.max_document_bytes {
                    Some(n) => store.with_max_document_bytes(n),
                    None => store,
                })
            }
            TargetSpec::Sqlite(path) => {
                let store = SqliteDocStore::open(path).map_err(|e| FatalError::Target(e.to_string()))?;
                Box::new(match self.opts.max_document_bytes {
                    Some(n) => store.with_max_document_bytes(n),
                    None => store,
                })
            }
        })
    }

    /// Open source and target from the options, then run.
    pub fn execute(&self) -> Result<(RunReport, Box<dyn DocumentStore>), FatalError> {
        init_tracing_once();
        self.opts.validate()?;
        let source = SourceReader::open(&self.opts.source, self.opts.layout.clone())?;
        let store = self.open_store()?;
        let report = self.run(&source, store.as_ref())?;
        Ok((report, store))
    }

    /// Migrate everything `source` holds into `store`.
    ///
    /// Errors only for fatal configuration problems, all detected before the
    /// first write. Everything after that is counted in the report.
    pub fn run(&self, source: &SourceReader, store: &dyn DocumentStore) -> Result<RunReport, FatalError> {
        init_tracing_once();
        if let Some(n) = self.opts.parallelism.filter(|&n| n > 0) {
            // Only the first call per process can size the global pool.
            rayon::ThreadPoolBuilder::new().num_threads(n).build_global().ok();
        }

        let started = Instant::now();
        let mut run = MigrationRun::new(&self.opts, source, store, self.cancel.clone());

        if let Err(e) = run.preflight() {
            run.enter(PipelineState::Failed);
            tracing::error!("Migration aborted before any write: {}", e);
            return Err(e);
        }

        for entity in EntityKind::DEPENDENCY_ORDER {
            if run.cancelled() {
                break;
            }
            match entity {
                EntityKind::User => run.simple_stage(entity, map_user),
                EntityKind::Subreddit => run.simple_stage(entity, map_subreddit),
                EntityKind::Post => run.simple_stage(entity, map_post),
                EntityKind::Comment => run.comment_stage(),
                EntityKind::Moderation => run.moderation_stage(),
            }
        }

        let indexes = if run.cancelled() {
            Vec::new()
        } else {
            run.enter(PipelineState::Indexing);
            ensure_standard_indexes(store)
        };

        let collection_counts: BTreeMap<_, _> = Collection::ALL
            .iter()
            .filter_map(|&c| store.count(c).ok().map(|n| (c, n)))
            .collect();
        for (c, n) in &collection_counts {
            tracing::info!("{:<11} {} document(s)", c.name(), n);
        }

        let audit_report = if self.opts.audit {
            match audit(store, self.opts.embed_cap) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!("Audit failed to complete: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        run.enter(PipelineState::Done);
        run.stats.log_summary();
        let outcome = if run.stats.has_integrity_errors() {
            RunOutcome::CompletedWithIntegrityErrors
        } else {
            RunOutcome::Completed
        };
        let report = RunReport {
            outcome,
            cancelled: run.cancelled(),
            stats: run.stats,
            trace: run.trace,
            indexes,
            collection_counts,
            audit: audit_report,
            elapsed_ms: started.elapsed().as_millis(),
        };
        tracing::info!("Migration finished: {:?} in {} ms", report.outcome, report.elapsed_ms);

        if let Some(path) = &self.opts.stats_path {
            if let Err(e) = write_report(&report, path) {
                tracing::warn!("Could not write run report to {}: {:#}", path.display(), e);
            }
        }
        Ok(report)
    }
}

fn write_report(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    let mut f = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
    serde_json::to_writer_pretty(&mut f, report)?;
    f.write_all(b"\n")?;
    f.flush()?;
    drop(f);
    replace_file_atomic_backoff(&tmp, path)
}

/// State of one run; lives only for the duration of `RedditMigration::run`.
struct MigrationRun<'a> {
    opts: &'a MigrateOptions,
    source: &'a SourceReader,
    store: &'a dyn DocumentStore,
    writer: WriteCoordinator<'a>,
    embed: EmbeddingController,
    cancel: CancelFlag,
    stats: RunStats,
    trace: Vec<PipelineState>,
}

impl<'a> MigrationRun<'a> {
    fn new(opts: &'a MigrateOptions, source: &'a SourceReader, store: &'a dyn DocumentStore, cancel: CancelFlag) -> Self {
        let policy = WritePolicy {
            batch_size: opts.batch_size,
            max_attempts: opts.write_attempts,
            retry_delay_ms: opts.retry_delay_ms,
            concurrency: opts.write_concurrency,
        };
        let ceiling = store.max_document_bytes();
        let byte_budget = ceiling.saturating_sub(POST_ENVELOPE_BYTES.min(ceiling / 4));
        Self {
            opts,
            source,
            store,
            writer: WriteCoordinator::new(store, policy, cancel.clone()),
            embed: EmbeddingController::new(EmbedPolicy { cap: opts.embed_cap, byte_budget }, opts.shard_count),
            cancel,
            stats: RunStats::default(),
            trace: vec![PipelineState::Idle],
        }
    }

    fn enter(&mut self, state: PipelineState) {
        if !self.trace.contains(&state) {
            tracing::debug!("State -> {:?}", state);
            self.trace.push(state);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn preflight(&mut self) -> Result<(), FatalError> {
        self.opts.validate()?;
        self.source.check_schema()?;
        if self.opts.reset {
            for c in Collection::ALL {
                self.store
                    .drop_collection(c)
                    .map_err(|e| FatalError::Target(format!("reset {c}: {e}")))?;
            }
            tracing::info!("Reset: dropped all target collections");
        }
        Ok(())
    }

    /// Null-key rows and the row total for the progress bar.
    fn open_stream(&mut self, entity: EntityKind) -> StageProgress {
        match self.source.null_key_rows(entity) {
            Ok(0) => {}
            Ok(n) => {
                tracing::warn!("{}: {} row(s) without a key skipped", entity, n);
                self.stats.record(entity, ErrorClass::RowValidation, n);
            }
            Err(e) => tracing::warn!("{}: null-key count failed: {:#}", entity, e),
        }
        // Keyset paging yields one row per key; extra rows sharing a key are never read.
        match self.source.duplicate_key_rows(entity) {
            Ok(0) => {}
            Ok(n) => {
                tracing::warn!("{}: {} row(s) repeat an earlier key and are skipped", entity, n);
                self.stats.record(entity, ErrorClass::RowValidation, n);
            }
            Err(e) => tracing::warn!("{}: duplicate-key count failed: {:#}", entity, e),
        }
        let total = if self.opts.progress {
            let n = self.source.count(entity).unwrap_or(0);
            self.opts.limit.map_or(n, |l| n.min(l))
        } else {
            0
        };
        StageProgress::new(self.opts.progress, total, entity.label())
    }

    /// Feed each chunk of one entity stream to `f` until it ends or the run is cancelled.
    fn for_each_chunk(&mut self, entity: EntityKind, mut f: impl FnMut(&mut Self, Vec<RawRow>)) {
        let progress = self.open_stream(entity);
        let source = self.source;
        let chunks = source
            .chunks(entity, self.opts.chunk_size)
            .limit(self.opts.limit)
            .retries(self.opts.read_attempts, self.opts.retry_delay_ms);

        self.enter(PipelineState::Reading(entity));
        for chunk in chunks {
            if self.cancelled() {
                tracing::warn!("{}: cancelled; no further chunks will be read", entity);
                break;
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("{}: stream ended early after read failure: {:#}", entity, e);
                    self.stats.entity_mut(entity).read_failures += 1;
                    break;
                }
            };
            let n = chunk.rows.len() as u64;
            self.stats.entity_mut(entity).rows_read += n;
            tracing::debug!("{}: chunk {} with {} row(s)", entity, chunk.index, n);
            f(self, chunk.rows);
            progress.inc(n);
        }
        let s = self.stats.entity(entity);
        progress.finish(format!("{} done", entity.label()));
        tracing::info!("{}: read {} written {} failed {}", entity, s.rows_read, s.written, s.failed_writes);
    }

    /// Map in parallel, keeping source order; failures are counted and logged.
    fn map_rows<T, M>(&mut self, entity: EntityKind, rows: &[RawRow], map: M) -> Vec<T>
    where
        T: Send,
        M: Fn(&RawRow) -> Result<T, RowValidationError> + Sync,
    {
        self.enter(PipelineState::Mapping(entity));
        let mapped: Vec<Result<T, RowValidationError>> = rows.par_iter().map(|r| map(r)).collect();
        let mut out = Vec::with_capacity(mapped.len());
        let mut rejected = 0u64;
        for m in mapped {
            match m {
                Ok(v) => out.push(v),
                Err(e) => {
                    rejected += 1;
                    tracing::debug!("{}: row rejected: {}", entity, e);
                }
            }
        }
        if rejected > 0 {
            self.stats.record(entity, ErrorClass::RowValidation, rejected);
        }
        self.stats.entity_mut(entity).mapped += out.len() as u64;
        out
    }

    fn record_write(&mut self, entity: EntityKind, report: &WriteReport) {
        let s = self.stats.entity_mut(entity);
        s.written += report.written;
        s.failed_writes += report.failed;
        s.failed_batches += report.failed_batches;
        s.write_retries += report.retries;
        // Oversized documents were never attempted; they count as capacity violations.
        s.record(ErrorClass::TransientWrite, report.retries + (report.failed - report.oversized));
        s.record(ErrorClass::CapacityViolation, report.capacity_violations);
        if report.skipped > 0 {
            tracing::warn!("{}: {} document(s) not written after cancellation", entity, report.skipped);
        }
    }

    fn write<D: Document>(&mut self, entity: EntityKind, docs: Vec<D>) -> WriteReport {
        self.enter(PipelineState::Writing(entity));
        let report = self.writer.upsert_docs(docs);
        self.record_write(entity, &report);
        report
    }

    /// Users, subreddits, posts: map and upsert, nothing to resolve.
    fn simple_stage<D, M>(&mut self, entity: EntityKind, map: M)
    where
        D: Document,
        M: Fn(&RawRow) -> Result<D, RowValidationError> + Sync,
    {
        self.for_each_chunk(entity, |run, rows| {
            let docs = run.map_rows(entity, &rows, &map);
            run.write(entity, docs);
        });
    }

    /// Store lookup with the write policy's transient retry.
    fn lookup<T>(&self, what: &str, op: impl FnMut(usize) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let policy = self.writer.policy();
        let (result, attempts) =
            retry_with_backoff(policy.max_attempts, policy.retry_delay_ms, StoreError::is_transient, op);
        if let Err(e) = &result {
            tracing::warn!("Lookup of {} failed after {} attempt(s): {}", what, attempts, e);
        }
        result
    }

    fn comment_stage(&mut self) {
        let entity = EntityKind::Comment;
        self.for_each_chunk(entity, |run, rows| {
            let comments = run.map_rows(entity, &rows, map_comment);
            if comments.is_empty() {
                return;
            }
            run.enter(PipelineState::Embedding);
            let resolved = run.resolve_posts(&comments);
            let candidates: Vec<CommentDoc> = comments
                .iter()
                .zip(&resolved)
                .filter(|(_, ok)| **ok)
                .map(|(c, _)| c.clone())
                .collect();

            // Only comments stored canonically take an embedding slot.
            let report = run.write(entity, comments);
            let failed: AHashSet<&str> = report.failed_keys.iter().map(String::as_str).collect();
            let admitted: Vec<CommentDoc> =
                candidates.into_iter().filter(|c| !failed.contains(c.id.as_str())).collect();
            let deltas = run.embed.admit(&admitted);
            run.splice_posts(deltas);
        });
    }

    /// Per comment: does its post exist in the store. Orphans are counted here.
    fn resolve_posts(&mut self, comments: &[CommentDoc]) -> Vec<bool> {
        let s = self.stats.entity_mut(EntityKind::Comment);
        for c in comments {
            match ParentRef::resolve(c.parent_id.as_deref(), c.post_id.as_deref()) {
                Some(ParentRef::Post(_)) => s.top_level += 1,
                Some(ParentRef::Comment(_)) => s.replies += 1,
                Some(ParentRef::Unknown(_)) | None => s.unknown_parents += 1,
            }
        }

        let mut wanted: Vec<&str> = comments.iter().filter_map(|c| c.post_id.as_deref()).collect();
        wanted.sort_unstable();
        wanted.dedup();
        let found = match self.lookup("posts", |_| self.store.existing_keys(Collection::Posts, &wanted)) {
            Ok(f) => f,
            Err(_) => {
                // Stored canonically either way; only embedding is skipped.
                self.stats.record(EntityKind::Comment, ErrorClass::TransientWrite, comments.len() as u64);
                return vec![false; comments.len()];
            }
        };

        let mut orphans = 0u64;
        let resolved: Vec<bool> = comments
            .iter()
            .map(|c| {
                let ok = c.post_id.as_deref().map_or(false, |p| found.contains(p));
                if !ok {
                    orphans += 1;
                    if orphans <= LOGGED_VIOLATIONS {
                        tracing::warn!(
                            "Orphan comment {}: post {} not found",
                            c.id,
                            c.post_id.as_deref().unwrap_or("<none>")
                        );
                    }
                }
                ok
            })
            .collect();
        if orphans > 0 {
            self.stats.record(EntityKind::Comment, ErrorClass::OrphanReference, orphans);
            if orphans > LOGGED_VIOLATIONS {
                tracing::warn!("{} orphan comment(s) in this chunk", orphans);
            }
        }
        resolved
    }

    /// Apply embedding deltas to their stored posts. A post that cannot be
    /// read back or rewritten gives its slots back to the controller.
    fn splice_posts(&mut self, deltas: Vec<PostDelta>) {
        if deltas.is_empty() {
            return;
        }

        let ids: Vec<&str> = deltas.iter().map(|d| d.post_id.as_str()).collect();
        let stored = match self.lookup("posts for embedding", |_| self.store.get_many(Collection::Posts, &ids)) {
            Ok(m) => m,
            Err(_) => {
                let s = self.stats.entity_mut(EntityKind::Post);
                s.failed_writes += deltas.len() as u64;
                s.record(ErrorClass::TransientWrite, deltas.len() as u64);
                for d in &deltas {
                    self.embed.rewind_embedding(&d.post_id, &d.before);
                }
                return;
            }
        };

        let mut posts: Vec<PostDoc> = Vec::with_capacity(deltas.len());
        let mut spliced: Vec<PostDelta> = Vec::with_capacity(deltas.len());
        let mut by_id: AHashMap<String, serde_json::Value> = stored;
        for d in deltas {
            let Some(raw) = by_id.remove(&d.post_id) else {
                tracing::warn!("Post {} vanished before its comments were embedded", d.post_id);
                self.embed.rewind_embedding(&d.post_id, &d.before);
                continue;
            };
            let mut post: PostDoc = match serde_json::from_value(raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Post {} is malformed in the store: {}", d.post_id, e);
                    self.embed.rewind_embedding(&d.post_id, &d.before);
                    continue;
                }
            };
            post.comments.truncate(d.embed_from as usize);
            post.comments.extend(d.embedded.iter().cloned());
            post.comment_count = d.comment_count;
            post.embedded_count = post.comments.len() as u64;
            post.embed_truncated |= d.sealed;
            posts.push(post);
            spliced.push(d);
        }

        let report = self.writer.upsert_docs(posts);
        let failed: AHashSet<&str> = report.failed_keys.iter().map(String::as_str).collect();
        let mut embedded = 0u64;
        let mut sealed = 0u64;
        for d in &spliced {
            if failed.contains(d.post_id.as_str()) {
                self.embed.rewind_embedding(&d.post_id, &d.before);
                continue;
            }
            embedded += d.embedded.len() as u64;
            sealed += d.sealed_now as u64;
        }
        if sealed > 0 {
            self.stats.record(EntityKind::Comment, ErrorClass::CapacityViolation, sealed);
        }
        let s = self.stats.entity_mut(EntityKind::Comment);
        s.embedded += embedded;
        s.post_updates += report.written;
        self.record_write(EntityKind::Post, &WriteReport { written: 0, ..report });
    }

    fn moderation_stage(&mut self) {
        let entity = EntityKind::Moderation;
        self.for_each_chunk(entity, |run, rows| {
            let records = run.map_rows(entity, &rows, map_moderation);
            if records.is_empty() {
                return;
            }
            let docs = run.resolve_moderation(records);
            run.write(entity, docs);
        });
    }

    /// Keep rows whose subreddit and target both exist; the rest are integrity violations.
    fn resolve_moderation(&mut self, records: Vec<ModerationRecord>) -> Vec<ModerationDoc> {
        let targets: Vec<TargetRef> = records
            .iter()
            .map(|r| TargetRef::resolve(&r.target_id, r.declared_type))
            .collect();

        let mut sub_keys: Vec<&str> = records.iter().filter_map(|r| r.subreddit_id.as_deref()).collect();
        let mut comment_keys: Vec<&str> = Vec::new();
        let mut post_keys: Vec<String> = Vec::new();
        for t in &targets {
            match t {
                TargetRef::Known { kind: TargetKind::Comment, key } => comment_keys.push(key),
                TargetRef::Known { kind: TargetKind::Post, key } => post_keys.push(key.clone()),
                TargetRef::Ambiguous(id) => {
                    comment_keys.push(id);
                    post_keys.push(id.clone());
                    post_keys.push(format!("t3_{id}"));
                }
            }
        }
        sub_keys.sort_unstable();
        sub_keys.dedup();
        let post_refs: Vec<&str> = post_keys.iter().map(String::as_str).collect();

        let store = self.store;
        let found = self
            .lookup("subreddits", |_| store.existing_keys(Collection::Subreddits, &sub_keys))
            .and_then(|subs| {
                let comments = self.lookup("comments", |_| store.existing_keys(Collection::Comments, &comment_keys))?;
                let posts = self.lookup("posts", |_| store.existing_keys(Collection::Posts, &post_refs))?;
                Ok((subs, comments, posts))
            });
        let (subs, comments, posts) = match found {
            Ok(f) => f,
            Err(_) => {
                self.stats.record(EntityKind::Moderation, ErrorClass::TransientWrite, records.len() as u64);
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(records.len());
        let mut violations = 0u64;
        for (rec, target) in records.into_iter().zip(targets) {
            let sub = rec.subreddit_id.clone().filter(|s| subs.contains(s));
            let resolved = match target {
                TargetRef::Known { kind: TargetKind::Comment, key } => {
                    comments.contains(&key).then_some((TargetKind::Comment, key))
                }
                TargetRef::Known { kind: TargetKind::Post, key } => {
                    posts.contains(&key).then_some((TargetKind::Post, key))
                }
                TargetRef::Ambiguous(id) => {
                    let full = format!("t3_{id}");
                    if comments.contains(&id) {
                        Some((TargetKind::Comment, id))
                    } else if posts.contains(&id) {
                        Some((TargetKind::Post, id))
                    } else if posts.contains(&full) {
                        Some((TargetKind::Post, full))
                    } else {
                        None
                    }
                }
            };
            match (sub, resolved) {
                (Some(sub), Some((kind, key))) => out.push(rec.into_doc(kind, key, sub)),
                (sub, resolved) => {
                    violations += 1;
                    if violations <= LOGGED_VIOLATIONS {
                        tracing::warn!(
                            "Moderation on {} dropped: {}",
                            rec.target_id,
                            match (sub, resolved) {
                                (None, _) => format!(
                                    "subreddit {} not found",
                                    rec.subreddit_id.as_deref().unwrap_or("<none>")
                                ),
                                _ => "target not found".to_string(),
                            }
                        );
                    }
                }
            }
        }
        if violations > 0 {
            self.stats.record(EntityKind::Moderation, ErrorClass::IntegrityViolation, violations);
            if violations > LOGGED_VIOLATIONS {
                tracing::warn!("{} moderation row(s) dropped in this chunk", violations);
            }
        }
        out
    }
}
