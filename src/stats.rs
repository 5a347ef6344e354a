//! End-of-run statistics: counts per entity stream and per error class.

use crate::error::ErrorClass;
use crate::model::EntityKind;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub rows_read: u64,
    pub mapped: u64,
    pub written: u64,
    pub failed_writes: u64,
    pub failed_batches: u64,
    /// Batch attempts that failed transiently and were retried.
    pub write_retries: u64,
    pub read_failures: u64,
    /// Per-class tallies of non-fatal errors.
    pub errors: BTreeMap<ErrorClass, u64>,
    // Comment-only breakdown of typed parent references.
    pub top_level: u64,
    pub replies: u64,
    pub unknown_parents: u64,
    pub embedded: u64,
    /// Posts re-upserted with newly embedded comments.
    pub post_updates: u64,
}

impl EntityStats {
    pub fn record(&mut self, class: ErrorClass, n: u64) {
        if n > 0 {
            *self.errors.entry(class).or_insert(0) += n;
        }
    }

    pub fn errors_of(&self, class: ErrorClass) -> u64 {
        self.errors.get(&class).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub entities: BTreeMap<EntityKind, EntityStats>,
}

impl RunStats {
    pub fn entity(&self, kind: EntityKind) -> EntityStats {
        self.entities.get(&kind).cloned().unwrap_or_default()
    }

    pub fn entity_mut(&mut self, kind: EntityKind) -> &mut EntityStats {
        self.entities.entry(kind).or_default()
    }

    pub fn record(&mut self, kind: EntityKind, class: ErrorClass, n: u64) {
        self.entity_mut(kind).record(class, n);
    }

    /// Sum of one error class over every entity stream.
    pub fn total(&self, class: ErrorClass) -> u64 {
        self.entities.values().map(|e| e.errors_of(class)).sum()
    }

    pub fn orphans(&self) -> u64 {
        self.total(ErrorClass::OrphanReference)
    }

    pub fn has_integrity_errors(&self) -> bool {
        self.total(ErrorClass::IntegrityViolation) > 0
    }

    /// One log line per stream.
    pub fn log_summary(&self) {
        for (kind, s) in &self.entities {
            tracing::info!(
                "{:<11} read={} mapped={} written={} failed={} retries={} errors={:?}",
                kind.label(),
                s.rows_read,
                s.mapped,
                s.written,
                s.failed_writes,
                s.write_retries,
                s.errors
            );
        }
    }
}
