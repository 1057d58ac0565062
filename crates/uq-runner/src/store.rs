use crate::cache::{QoiMap, RawResult, StageCache};
use crate::error::UqError;
use crate::sample::{TransformedKey, UnitKey};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const SCHEMA_VERSION: &str = "uq_cache_v1";
const ENTRY_NAME: &str = "cache.json";

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    schema_version: String,
    written_at: String,
    lastid: u64,
    verbose: bool,
    #[serde(default)]
    setup_digest: Option<String>,
    preprocessed: Vec<(UnitKey, TransformedKey)>,
    preprocessed_reverse: Vec<(TransformedKey, UnitKey)>,
    simulated: Vec<(TransformedKey, RawResult)>,
    postprocessed: Vec<(TransformedKey, QoiMap)>,
}

fn storage(context: &str, path: &Path, err: impl std::fmt::Display) -> UqError {
    UqError::Storage(format!("{} {}: {}", context, path.display(), err))
}

pub(crate) fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Serializes the four stage maps, the id counter and the verbosity flag into
/// a deflated zip archive and replaces `path` atomically.
pub fn write_cache(path: &Path, cache: &StageCache) -> Result<(), UqError> {
    let entries = cache.entries();
    let doc = CacheDocument {
        schema_version: SCHEMA_VERSION.to_string(),
        written_at: Utc::now().to_rfc3339(),
        lastid: cache.lastid(),
        verbose: cache.verbose(),
        setup_digest: cache.setup_digest().map(str::to_string),
        preprocessed: sorted(entries.preprocessed),
        preprocessed_reverse: sorted(entries.preprocessed_reverse),
        simulated: sorted(entries.simulated),
        postprocessed: sorted(entries.postprocessed),
    };
    let json = serde_json::to_vec(&doc).map_err(|e| storage("failed to encode", path, e))?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer
        .start_file(ENTRY_NAME, options)
        .map_err(|e| storage("failed to compress", path, e))?;
    writer
        .write_all(&json)
        .map_err(|e| storage("failed to compress", path, e))?;
    let bytes = writer
        .finish()
        .map_err(|e| storage("failed to compress", path, e))?
        .into_inner();

    atomic_write_bytes(path, &bytes).map_err(|e| storage("failed to write", path, e))?;
    debug!(path = %path.display(), bytes = bytes.len(), "cache written");
    Ok(())
}

pub fn read_cache(path: &Path) -> Result<StageCache, UqError> {
    let file = fs::File::open(path).map_err(|e| storage("failed to open", path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| storage("not a cache archive", path, e))?;
    let mut entry = archive
        .by_name(ENTRY_NAME)
        .map_err(|e| storage("missing cache entry in", path, e))?;
    let mut json = Vec::new();
    entry
        .read_to_end(&mut json)
        .map_err(|e| storage("failed to decompress", path, e))?;
    let doc: CacheDocument =
        serde_json::from_slice(&json).map_err(|e| storage("failed to decode", path, e))?;
    if doc.schema_version != SCHEMA_VERSION {
        return Err(storage(
            "unsupported schema version in",
            path,
            &doc.schema_version,
        ));
    }

    let mut cache = StageCache::from_entries(
        to_map(doc.preprocessed),
        to_map(doc.preprocessed_reverse),
        to_map(doc.simulated),
        to_map(doc.postprocessed),
    )?;
    cache.set_lastid(doc.lastid);
    cache.set_verbose(doc.verbose);
    cache.set_setup_digest(doc.setup_digest);
    Ok(cache)
}

/// Reads the cache at `path`, or starts an empty one if the file does not exist yet.
pub fn open_or_create(path: &Path, verbose: bool) -> Result<StageCache, UqError> {
    if path.exists() {
        read_cache(path)
    } else {
        Ok(StageCache::new(verbose))
    }
}

/// Name of the `seq`-th worker output file next to `base`:
/// `results.uqcache` becomes `results.3.uqcache`.
pub fn numbered_file_name(base: &Path, seq: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cache");
    let name = match base.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem, seq, ext),
        None => format!("{}.{}", stem, seq),
    };
    PathBuf::from(name)
}

fn sorted<K: Ord + Clone, V: Clone>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    let mut out: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn to_map<K: std::hash::Hash + Eq, V>(entries: Vec<(K, V)>) -> HashMap<K, V> {
    entries.into_iter().collect()
}
