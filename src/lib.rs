mod config;
mod error;
mod model;
mod thing;
mod layout;
mod source;
mod mapper;

mod embed;
mod store;
mod sqlite_store;
mod indexes;
mod writer;
mod concurrency;

mod stats;
mod audit;
mod export;
mod progress;
mod util;
mod mem;
mod pipeline;

pub use crate::config::{MigrateOptions, TargetSpec};
pub use crate::error::{ErrorClass, FatalError, RowValidationError, StoreError};
pub use crate::model::{
    Collection, CommentDoc, Document, EntityKind, ModerationDoc, PostDoc, SubredditDoc, SubredditRef, TargetKind,
    UserDoc,
};
pub use crate::pipeline::{PipelineState, RedditMigration, RunOutcome, RunReport};

// Source side: layouts, reader, raw rows.
pub use crate::layout::SourceLayout;
pub use crate::source::{Chunk, ChunkIter, ChunkKey, RawRow, RawValue, SourceReader};

// Row mapping and reference typing.
pub use crate::mapper::{
    coerce_bool, coerce_edited, coerce_epoch, coerce_int, coerce_text, map_comment, map_moderation, map_post,
    map_subreddit, map_user, ModerationRecord, PSEUDO_AUTHORS,
};
pub use crate::thing::{split_fullname, ParentRef, TargetRef, ThingKind};

// Embedding and writes.
pub use crate::embed::{EmbedPolicy, EmbeddingController, PostDelta, PostSlot};
pub use crate::writer::{CancelFlag, WriteCoordinator, WritePolicy, WriteReport};

// Document stores and indexes.
pub use crate::indexes::{ensure_standard_indexes, IndexOutcome, IndexReport, IndexSpec, STANDARD_INDEXES};
pub use crate::sqlite_store::SqliteDocStore;
pub use crate::store::{DocumentStore, MemoryStore, UpsertIntent, DEFAULT_MAX_DOCUMENT_BYTES};

// Reporting, verification, export.
pub use crate::audit::{audit, AuditReport, AuditViolation};
pub use crate::export::{export_all, export_collection, ExportFormat};
pub use crate::stats::{EntityStats, RunStats};

// Expose multiprogress so binaries can stack their own bars with ours.
pub use crate::progress::set_global_multiprogress;

// Expose memory helpers for adaptive throttling from the binary.
pub use crate::mem::{available_memory_fraction, is_low_memory};

pub use crate::util::init_tracing_once;
