use crate::error::FatalError;
use crate::export::ExportFormat;
use crate::layout::SourceLayout;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where documents are written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TargetSpec {
    /// Process-local store (tests, dry runs).
    #[default]
    Memory,
    /// SQLite JSON document store at the given path.
    Sqlite(PathBuf),
}

impl FromStr for TargetSpec {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty target descriptor".to_string());
        }
        if s.eq_ignore_ascii_case("memory") {
            return Ok(TargetSpec::Memory);
        }
        let path = s.strip_prefix("sqlite:").unwrap_or(s);
        if path.is_empty() {
            return Err(format!("target `{s}` has no path"));
        }
        Ok(TargetSpec::Sqlite(PathBuf::from(path)))
    }
}

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct MigrateOptions {
    pub source: PathBuf,
    pub layout: SourceLayout,
    pub target: TargetSpec,
    pub chunk_size: usize,            // source rows per window
    pub embed_cap: usize,             // 0 disables embedding
    pub reset: bool,                  // drop target collections first
    pub limit: Option<u64>,           // per entity stream (sample runs)

    // writes
    pub batch_size: usize,
    pub write_attempts: usize,
    pub retry_delay_ms: u64,
    pub write_concurrency: usize,

    // reads
    pub read_attempts: usize,

    pub shard_count: usize,           // embedding counter shards
    pub parallelism: Option<usize>,   // Some(N) to set rayon threads, None to use default
    pub max_document_bytes: Option<usize>, // override the store's ceiling
    pub progress: bool,
    pub stats_path: Option<PathBuf>,  // write RunReport JSON here
    pub audit: bool,                  // verify invariants after load
    pub export_dir: Option<PathBuf>,  // dump every collection here after the run
    pub export_format: ExportFormat,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            source: PathBuf::from("./data/database.sqlite"),
            layout: SourceLayout::Normalized,
            target: TargetSpec::Memory,
            chunk_size: 50_000,
            embed_cap: 200,
            reset: false,
            limit: None,

            batch_size: 1000,
            write_attempts: 5,
            retry_delay_ms: 100,
            write_concurrency: 1,

            read_attempts: 3,

            shard_count: 64,
            parallelism: None,
            max_document_bytes: None,
            progress: false,
            stats_path: None,
            audit: false,
            export_dir: None,
            export_format: ExportFormat::Zst,
        }
    }
}

impl MigrateOptions {
    pub fn with_source(mut self, path: impl AsRef<Path>) -> Self {
        self.source = path.as_ref().to_path_buf();
        self
    }
    pub fn with_layout(mut self, layout: SourceLayout) -> Self {
        self.layout = layout;
        self
    }
    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.target = target;
        self
    }
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }
    pub fn with_embed_cap(mut self, cap: usize) -> Self {
        self.embed_cap = cap;
        self
    }
    pub fn with_reset(mut self, yes: bool) -> Self {
        self.reset = yes;
        self
    }
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }
    pub fn with_write_attempts(mut self, n: usize) -> Self {
        self.write_attempts = n;
        self
    }
    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }
    pub fn with_write_concurrency(mut self, n: usize) -> Self {
        self.write_concurrency = n.max(1);
        self
    }
    pub fn with_read_attempts(mut self, n: usize) -> Self {
        self.read_attempts = n.max(1);
        self
    }
    pub fn with_shard_count(mut self, shards: usize) -> Self {
        self.shard_count = shards.max(1);
        self
    }
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = Some(threads);
        self
    }
    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = Some(bytes);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_stats_path(mut self, path: impl AsRef<Path>) -> Self {
        self.stats_path = Some(path.as_ref().to_path_buf());
        self
    }
    pub fn with_audit(mut self, yes: bool) -> Self {
        self.audit = yes;
        self
    }
    pub fn with_export(mut self, dir: impl AsRef<Path>, format: ExportFormat) -> Self {
        self.export_dir = Some(dir.as_ref().to_path_buf());
        self.export_format = format;
        self
    }

    /// Reject values that would make the run meaningless. Called before any write.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.chunk_size == 0 {
            return Err(FatalError::InvalidOption("chunk size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(FatalError::InvalidOption("write batch size must be positive".into()));
        }
        if self.write_attempts == 0 {
            return Err(FatalError::InvalidOption("write attempts must be at least 1".into()));
        }
        if matches!(self.max_document_bytes, Some(n) if n < 1024) {
            return Err(FatalError::InvalidOption("max document bytes must be at least 1024".into()));
        }
        self.layout.validate()
    }

    /// Defaults overlaid with `MIGRATE_*` environment variables.
    pub fn from_env() -> Result<Self, FatalError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, FatalError> {
        let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut o = Self::default();

        if let Some(v) = var("MIGRATE_SOURCE") {
            o.source = PathBuf::from(v);
        }
        if let Some(v) = var("MIGRATE_LAYOUT") {
            o.layout = v.parse().map_err(FatalError::InvalidOption)?;
        }
        if let Some(v) = var("MIGRATE_TARGET") {
            o.target = v.parse().map_err(FatalError::InvalidOption)?;
        }
        if let Some(v) = var("MIGRATE_CHUNK_SIZE") {
            o.chunk_size = parse_num("MIGRATE_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("MIGRATE_EMBED_CAP") {
            o.embed_cap = parse_num("MIGRATE_EMBED_CAP", &v)?;
        }
        if let Some(v) = var("MIGRATE_RESET") {
            o.reset = parse_flag("MIGRATE_RESET", &v)?;
        }
        if let Some(v) = var("MIGRATE_LIMIT") {
            o.limit = Some(parse_num("MIGRATE_LIMIT", &v)?);
        }
        if let Some(v) = var("MIGRATE_BATCH_SIZE") {
            o.batch_size = parse_num("MIGRATE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = var("MIGRATE_WRITE_ATTEMPTS") {
            o.write_attempts = parse_num("MIGRATE_WRITE_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("MIGRATE_PARALLELISM") {
            o.parallelism = Some(parse_num("MIGRATE_PARALLELISM", &v)?);
        }
        if let Some(v) = var("MIGRATE_STATS_PATH") {
            o.stats_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MIGRATE_PROGRESS") {
            o.progress = parse_flag("MIGRATE_PROGRESS", &v)?;
        }
        if let Some(v) = var("MIGRATE_AUDIT") {
            o.audit = parse_flag("MIGRATE_AUDIT", &v)?;
        }
        if let Some(v) = var("MIGRATE_EXPORT_DIR") {
            o.export_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MIGRATE_EXPORT_FORMAT") {
            o.export_format = v.parse().map_err(FatalError::InvalidOption)?;
        }
        Ok(o)
    }
}

fn parse_num<T: FromStr>(name: &str, v: &str) -> Result<T, FatalError> {
    v.parse()
        .map_err(|_| FatalError::InvalidOption(format!("{name}=`{v}` is not a non-negative integer")))
}

fn parse_flag(name: &str, v: &str) -> Result<bool, FatalError> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FatalError::InvalidOption(format!("{name}=`{v}` is not a boolean"))),
    }
}
