pub mod dduf;
pub mod gguf;
pub mod safetensors;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classify::{self, FileKind};
use crate::config::Config;
use crate::error;
use crate::mediatype::MediaType;

/// Weight file formats understood by this crate. Unknown tokens coming in
/// from foreign configs are preserved rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Format {
    Gguf,
    Safetensors,
    Diffusers,
    Other(String),
}

impl Format {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Gguf => "gguf",
            Self::Safetensors => "safetensors",
            Self::Diffusers => "diffusers",
            Self::Other(value) => value.as_str(),
        }
    }

    /// Normalize a format token. Tokens are lowercased before matching;
    /// unknown values pass through.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "gguf" => Self::Gguf,
            "safetensors" => Self::Safetensors,
            "diffusers" => Self::Diffusers,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Format {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Ok(Format::parse(string.as_str()))
    }
}

/// Detect the weight format of a single path from its filename.
pub fn detect(path: &Path) -> crate::Result<Format> {
    match classify::classify(path) {
        FileKind::WeightGguf => Ok(Format::Gguf),
        FileKind::WeightSafetensors => Ok(Format::Safetensors),
        FileKind::WeightDduf => Ok(Format::Diffusers),
        _ => error::FormatUnknownSnafu {
            path: path.display().to_string(),
        }
        .fail(),
    }
}

/// Detect the format of a path list, requiring homogeneity.
pub fn detect_all(paths: &[PathBuf]) -> crate::Result<Format> {
    let mut paths = paths.iter();
    let first = paths.next().ok_or(error::Error::EmptyPathList)?;
    let format = detect(first)?;
    for path in paths {
        if detect(path)? != format {
            return error::FormatMixedSnafu.fail();
        }
    }
    Ok(format)
}

/// An adapter for one weight format: its layer media type, shard
/// discovery, and config extraction from the binary header.
#[async_trait]
pub trait FormatAdapter: Send + Sync {
    fn format(&self) -> Format;
    /// Media type assigned to weight layers of this format
    fn media_type(&self) -> MediaType;
    /// Expand a path to its complete sorted shard set (or itself)
    fn discover_shards(&self, path: &Path) -> crate::Result<Vec<PathBuf>>;
    /// Extract format-native metadata from the weight file headers
    async fn extract_config(&self, paths: &[PathBuf]) -> crate::Result<Config>;
}

/// Registry of format adapters. Passed explicitly to the builder rather
/// than living in process-global state.
#[derive(Clone)]
pub struct FormatRegistry {
    adapters: Vec<Arc<dyn FormatAdapter>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self {
            adapters: vec![
                Arc::new(gguf::GgufAdapter),
                Arc::new(safetensors::SafetensorsAdapter),
                Arc::new(dduf::DdufAdapter),
            ],
        }
    }
}

impl FormatRegistry {
    pub fn adapter(&self, format: &Format) -> crate::Result<&dyn FormatAdapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.format() == *format)
            .map(AsRef::as_ref)
            .ok_or_else(|| error::Error::FormatUnknown {
                path: format.to_string(),
            })
    }
}

/// One member of a sharded weight set named
/// `<prefix>-<NNNNN>-of-<MMMMM>.<ext>` with 5-digit zero-padded indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub prefix: String,
    pub index: u32,
    pub total: u32,
    pub extension: String,
}

impl Shard {
    /// Parse a shard filename. Returns None for single-file names.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let (head, total) = stem.rsplit_once("-of-")?;
        let (prefix, index) = head.rsplit_once('-')?;
        if total.len() != 5 || index.len() != 5 {
            return None;
        }
        if !total.bytes().all(|b| b.is_ascii_digit()) || !index.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            index: index.parse().ok()?,
            total: total.parse().ok()?,
            extension: extension.to_string(),
        })
    }

    /// Render the filename of shard `index` within this set
    pub fn name_of(&self, index: u32) -> String {
        format!(
            "{}-{:05}-of-{:05}.{}",
            self.prefix, index, self.total, self.extension
        )
    }
}

/// Expand one path into its complete shard set. A non-shard filename is
/// returned alone. Every index `1..=total` must exist beside the given
/// path; the sorted order is lexicographic, which equals numeric order by
/// construction of the zero-padded names.
pub fn discover_shards(path: &Path) -> crate::Result<Vec<PathBuf>> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return error::FormatUnknownSnafu {
            path: path.display().to_string(),
        }
        .fail();
    };
    let Some(shard) = Shard::parse(file_name) else {
        return Ok(vec![path.to_path_buf()]);
    };
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut found = Vec::with_capacity(shard.total as usize);
    for index in 1..=shard.total {
        let candidate = dir.join(shard.name_of(index));
        if candidate.is_file() {
            found.push(candidate);
        }
    }
    if found.len() != shard.total as usize {
        return error::ShardsIncompleteSnafu {
            prefix: shard.prefix,
            found: found.len(),
            total: shard.total as usize,
        }
        .fail();
    }
    Ok(found)
}

/// Render a parameter count with base-1000 units and no space between
/// number and unit, e.g. `360.8M` or `7.2B`.
pub fn format_parameters(count: u64) -> String {
    humanate(count, &["", "K", "M", "B", "T"])
}

/// Render a byte size with base-1000 units and no space between number
/// and unit, e.g. `4.4GB`.
pub fn format_size(bytes: u64) -> String {
    humanate(bytes, &["B", "kB", "MB", "GB", "TB", "PB", "EB"])
}

fn humanate(value: u64, units: &[&str]) -> String {
    if value < 1000 {
        return format!("{}{}", value, units[0]);
    }
    let exponent = (((value as f64).ln() / 1000_f64.ln()).floor() as usize).min(units.len() - 1);
    let scaled = value as f64 / 1000_f64.powi(exponent as i32);
    // round to one decimal place first so 999.96 carries into the next unit
    let scaled = (scaled * 10.0 + 0.5).floor() / 10.0;
    let unit = units[exponent];
    if scaled < 10.0 {
        format!("{:.1}{}", scaled, unit)
    } else {
        format!("{:.0}{}", scaled, unit)
    }
}
