//! Dump collections to NDJSON, optionally zstd-compressed.

use crate::model::Collection;
use crate::store::DocumentStore;
use crate::util::{create_with_backoff, replace_file_atomic_backoff};
use anyhow::{Context, Result};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zstd::stream::write::Encoder as ZstdEncoder;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    Jsonl,
    #[default]
    Zst,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
            "zst" | "zstd" | "jsonl.zst" => Ok(ExportFormat::Zst),
            other => Err(format!("unknown export format `{other}` (expected jsonl or zst)")),
        }
    }
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Zst => "jsonl.zst",
        }
    }
}

const WRITE_BUF: usize = 256 * 1024;
const ZSTD_LEVEL: i32 = 19;

/// Write one collection to `out_path`, one document per line in key order.
/// The file appears only once complete. Returns the number of documents.
pub fn export_collection(store: &dyn DocumentStore, collection: Collection, out_path: &Path, format: ExportFormat) -> Result<u64> {
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let tmp = out_path.with_extension("tmp");
    let file = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
    let mut out = BufWriter::with_capacity(WRITE_BUF, file);
    let n = match format {
        ExportFormat::Jsonl => write_lines(store, collection, &mut out)?,
        ExportFormat::Zst => {
            let mut enc = ZstdEncoder::new(&mut out, ZSTD_LEVEL)?;
            let n = write_lines(store, collection, &mut enc)?;
            enc.finish().context("finish zstd stream")?;
            n
        }
    };
    out.flush().with_context(|| format!("flush {}", tmp.display()))?;
    drop(out);
    replace_file_atomic_backoff(&tmp, out_path)?;
    tracing::info!("Exported {} {} document(s) to {}", n, collection, out_path.display());
    Ok(n)
}

fn write_lines<W: Write>(store: &dyn DocumentStore, collection: Collection, w: &mut W) -> Result<u64> {
    let mut n = 0u64;
    store.for_each(collection, &mut |_, doc| {
        serde_json::to_writer(&mut *w, doc)?;
        w.write_all(b"\n")?;
        n += 1;
        Ok(())
    })?;
    Ok(n)
}

/// Export every collection into `out_dir` as `<collection>.<ext>`.
pub fn export_all(store: &dyn DocumentStore, out_dir: &Path, format: ExportFormat) -> Result<Vec<(Collection, PathBuf, u64)>> {
    Collection::ALL
        .iter()
        .map(|&c| {
            let path = out_dir.join(format!("{}.{}", c.name(), format.extension()));
            let n = export_collection(store, c, &path, format)?;
            Ok((c, path, n))
        })
        .collect()
}
