//! Size-bounded gzip JSON-lines shards.
//!
//! A shard is written under a hidden temp name and only renamed to
//! `<prefix>_<00000>.jsonl.gz` once it is closed, so partially written shards
//! are never visible under their final name. Closed names are never reopened.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use curio_core::ShardRef;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

const SHARD_SUFFIX: &str = ".jsonl.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLimits {
    pub max_records: u64,
    /// Uncompressed JSON-lines bytes.
    pub max_bytes: u64,
}

impl Default for ShardLimits {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedShard {
    pub name: String,
    pub index: u32,
    pub path: PathBuf,
    pub records: u64,
    pub bytes: u64,
}

struct OpenShard {
    encoder: GzEncoder<BufWriter<File>>,
    temp_path: PathBuf,
    index: u32,
    records: u64,
    bytes: u64,
}

/// Single-writer shard sink for one pool.
pub struct ShardWriter {
    dir: PathBuf,
    prefix: String,
    limits: ShardLimits,
    next_index: u32,
    current: Option<OpenShard>,
    closed: Vec<ClosedShard>,
}

pub fn shard_name(prefix: &str, index: u32) -> String {
    format!("{prefix}_{index:05}{SHARD_SUFFIX}")
}

fn parse_shard_index(prefix: &str, file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(SHARD_SUFFIX)?
        .parse()
        .ok()
}

/// Closed shards for `prefix` in `dir`, in index order.
pub fn closed_shards(dir: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = parse_shard_index(prefix, &name) {
            out.push((index, entry.path()));
        }
    }
    out.sort_by_key(|(index, _)| *index);
    Ok(out)
}

/// Read every record of a closed shard.
pub fn read_shard<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("opening shard {}", path.display()))?;
    let reader = BufReader::new(GzDecoder::new(file));
    let mut out = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading shard {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line)
            .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
        out.push(value);
    }
    Ok(out)
}

impl ShardWriter {
    /// Open a writer, discarding orphaned temp shards and continuing after the
    /// highest closed index.
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>, limits: ShardLimits) -> Result<Self> {
        let dir = dir.into();
        let prefix = prefix.into();
        if limits.max_records == 0 || limits.max_bytes == 0 {
            bail!("shard limits must be positive, got {limits:?}");
        }
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let orphan_prefix = format!(".{prefix}_");
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&orphan_prefix) && name.ends_with(".tmp") {
                warn!(shard = %name, "removing orphaned partial shard");
                fs::remove_file(entry.path())
                    .with_context(|| format!("removing {}", entry.path().display()))?;
            }
        }

        let next_index = closed_shards(&dir, &prefix)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);

        debug!(dir = %dir.display(), prefix, next_index, "shard writer opened");
        Ok(Self {
            dir,
            prefix,
            limits,
            next_index,
            current: None,
            closed: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_open(&mut self) -> Result<&mut OpenShard> {
        if self.current.is_none() {
            let index = self.next_index;
            let temp_path = self
                .dir
                .join(format!(".{}.tmp", shard_name(&self.prefix, index)));
            let file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .with_context(|| format!("creating shard {}", temp_path.display()))?;
            self.current = Some(OpenShard {
                encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
                temp_path,
                index,
                records: 0,
                bytes: 0,
            });
        }
        self.current
            .as_mut()
            .context("shard writer has no open shard")
    }

    /// Append one record; closes the shard when it reaches a limit.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<ShardRef> {
        let mut line = serde_json::to_vec(record).context("serializing shard record")?;
        line.push(b'\n');

        let name_prefix = self.prefix.clone();
        let limits = self.limits;
        let shard = self.ensure_open()?;
        shard
            .encoder
            .write_all(&line)
            .with_context(|| format!("writing shard {}", shard.temp_path.display()))?;
        let shard_ref = ShardRef {
            shard: shard_name(&name_prefix, shard.index),
            index: shard.index,
            line: shard.records,
        };
        shard.records += 1;
        shard.bytes += line.len() as u64;

        if shard.records >= limits.max_records || shard.bytes >= limits.max_bytes {
            self.close_current()?;
        }
        Ok(shard_ref)
    }

    /// Close the open shard, if any, and move it to its final name.
    pub fn close_current(&mut self) -> Result<Option<ClosedShard>> {
        let Some(shard) = self.current.take() else {
            return Ok(None);
        };
        let OpenShard {
            encoder,
            temp_path,
            index,
            records,
            bytes,
        } = shard;

        let mut writer = encoder
            .finish()
            .with_context(|| format!("finishing shard {}", temp_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flushing shard {}", temp_path.display()))?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing shard {}: {}", temp_path.display(), e.error()))?;
        file.sync_all()
            .with_context(|| format!("syncing shard {}", temp_path.display()))?;
        drop(file);

        let name = shard_name(&self.prefix, index);
        let final_path = self.dir.join(&name);
        if final_path.exists() {
            bail!("refusing to reopen closed shard {}", final_path.display());
        }
        fs::rename(&temp_path, &final_path).with_context(|| {
            format!(
                "renaming shard {} -> {}",
                temp_path.display(),
                final_path.display()
            )
        })?;
        self.next_index = index + 1;

        info!(shard = %name, records, bytes, "closed shard");
        let closed = ClosedShard {
            name,
            index,
            path: final_path,
            records,
            bytes,
        };
        self.closed.push(closed.clone());
        Ok(Some(closed))
    }

    /// Close any open shard and return every shard closed by this writer.
    pub fn finish(mut self) -> Result<Vec<ClosedShard>> {
        self.close_current()?;
        Ok(std::mem::take(&mut self.closed))
    }
}
