//! Runtime-configurable tuning parameters for the shared-memory engine.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `NEXAR_SHM_`) or by constructing a custom `ShmConfig`.

use std::path::PathBuf;

use crate::error::{Result, ShmCommError};
use crate::flag::DEFAULT_SPIN_BUDGET;

/// Tuning parameters for hierarchy formation and the collectives.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Locality levels, most specific first (see [`crate::topology::parse_hierarchy`]).
    pub hierarchy: String,

    /// Pipeline chunk size per hierarchy level. Level `i` uses entry
    /// `min(i, len - 1)`.
    pub chunk_sizes: Vec<usize>,

    /// Payloads up to this many bytes are staged through shared buffers
    /// instead of being read directly from the owner's memory.
    pub cico_max: usize,

    /// Maximum number of released-but-not-gathered chunks per group.
    pub pipeline_depth: u32,

    /// Directory holding the backing files of shared segments.
    pub backing_dir: PathBuf,

    /// Polls of a flag before the progress hook runs.
    pub spin_budget: u32,

    /// Route `reduce` with root 0 through the full-buffer shard mode.
    pub force_reduce: bool,

    /// Log the formed hierarchy at info level.
    pub print_info: bool,

    /// Export `AM_<LEVEL>_LEADER=1` on participants that manage their
    /// lowest socket, NUMA or L3 group (see [`crate::ShmComm::leader_env`]).
    pub set_hierarchy_envs: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            hierarchy: "numa,socket".to_string(),
            chunk_sizes: vec![16 * 1024], // 16 KiB
            cico_max: 1024,
            pipeline_depth: 4,
            backing_dir: default_backing_dir(),
            spin_budget: DEFAULT_SPIN_BUDGET,
            force_reduce: false,
            print_info: false,
            set_hierarchy_envs: false,
        }
    }
}

impl ShmConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NEXAR_SHM_HIERARCHY`
    /// - `NEXAR_SHM_CHUNK_SIZE` (e.g. `16K` or `16K,64K,1M`)
    /// - `NEXAR_SHM_CICO_MAX`
    /// - `NEXAR_SHM_PIPELINE_DEPTH`
    /// - `NEXAR_SHM_BACKING_DIR`
    /// - `NEXAR_SHM_SPIN_BUDGET`
    /// - `NEXAR_SHM_FORCE_REDUCE`
    /// - `NEXAR_SHM_PRINT_INFO`
    /// - `NEXAR_SHM_SET_HIERARCHY_ENVS`
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("NEXAR_SHM_HIERARCHY") {
            cfg.hierarchy = v;
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_CHUNK_SIZE") {
            if let Ok(sizes) = parse_chunk_sizes(&v) {
                cfg.chunk_sizes = sizes;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_CICO_MAX") {
            if let Ok(n) = parse_size(&v) {
                cfg.cico_max = n;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_PIPELINE_DEPTH") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.pipeline_depth = n;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_BACKING_DIR") {
            cfg.backing_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_SPIN_BUDGET") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.spin_budget = n;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_FORCE_REDUCE") {
            if let Some(b) = parse_bool(&v) {
                cfg.force_reduce = b;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_PRINT_INFO") {
            if let Some(b) = parse_bool(&v) {
                cfg.print_info = b;
            }
        }
        if let Ok(v) = std::env::var("NEXAR_SHM_SET_HIERARCHY_ENVS") {
            if let Some(b) = parse_bool(&v) {
                cfg.set_hierarchy_envs = b;
            }
        }

        cfg
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(ShmCommError::config("pipeline depth must be at least 1"));
        }
        if self.chunk_sizes.is_empty() {
            return Err(ShmCommError::config("at least one chunk size is required"));
        }
        if self.chunk_sizes.contains(&0) {
            return Err(ShmCommError::config("chunk sizes must be non-zero"));
        }
        Ok(())
    }

    /// Chunk size used by hierarchy level `level`.
    pub fn chunk_size(&self, level: usize) -> usize {
        let idx = level.min(self.chunk_sizes.len().saturating_sub(1));
        self.chunk_sizes.get(idx).copied().unwrap_or(16 * 1024)
    }
}

fn default_backing_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    match std::fs::metadata(&shm) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => shm,
        _ => std::env::temp_dir(),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a byte count with an optional `K`, `M` or `G` suffix (powers of 1024).
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, mult) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1024),
        Some((i, 'm' | 'M')) => (&s[..i], 1024 * 1024),
        Some((i, 'g' | 'G')) => (&s[..i], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShmCommError::config(format!("bad size '{s}'")));
    }
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(mult))
        .ok_or_else(|| ShmCommError::config(format!("size '{s}' out of range")))
}

/// Parse a comma-separated list of sizes, one per hierarchy level.
pub fn parse_chunk_sizes(s: &str) -> Result<Vec<usize>> {
    let sizes = s
        .split(',')
        .filter(|tok| !tok.trim().is_empty())
        .map(parse_size)
        .collect::<Result<Vec<_>>>()?;
    if sizes.is_empty() {
        return Err(ShmCommError::config(format!("bad chunk size list '{s}'")));
    }
    Ok(sizes)
}
