use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::error;
use crate::format::{self, Format, FormatAdapter};
use crate::mediatype::MediaType;

/// Upper bound on the JSON header length field. Anything larger is a
/// corrupt or hostile file.
const MAX_HEADER_SIZE: u64 = 100 * 1024 * 1024;

pub struct SafetensorsAdapter;

#[async_trait]
impl FormatAdapter for SafetensorsAdapter {
    fn format(&self) -> Format {
        Format::Safetensors
    }

    fn media_type(&self) -> MediaType {
        MediaType::Safetensors
    }

    fn discover_shards(&self, path: &Path) -> crate::Result<Vec<PathBuf>> {
        format::discover_shards(path)
    }

    async fn extract_config(&self, paths: &[PathBuf]) -> crate::Result<Config> {
        let mut parameters: u64 = 0;
        let mut dtypes = BTreeSet::new();
        let mut metadata = HashMap::new();
        let mut size: u64 = 0;
        for path in paths {
            let header = Header::read(path.as_path()).await?;
            for tensor in header.tensors.values() {
                parameters =
                    parameters.saturating_add(tensor.shape.iter().product::<u64>());
                dtypes.insert(tensor.dtype.clone());
            }
            metadata.extend(header.metadata);
            size += tokio::fs::metadata(path)
                .await
                .context(error::FileSnafu)?
                .len();
        }
        let quantization = match dtypes.len() {
            0 => "unknown".to_string(),
            1 => dtypes.into_iter().next().unwrap_or_default(),
            _ => "mixed".to_string(),
        };
        Ok(Config {
            format: Some(Format::Safetensors),
            quantization: Some(quantization),
            parameters: Some(format::format_parameters(parameters)),
            size: Some(format::format_size(size)),
            safetensors: (!metadata.is_empty()).then_some(metadata),
            ..Default::default()
        })
    }
}

#[derive(Debug, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<u64>,
    #[allow(dead_code)]
    data_offsets: [u64; 2],
}

/// Parsed safetensors JSON header: the `__metadata__` block plus one
/// entry per tensor.
#[derive(Debug)]
struct Header {
    metadata: HashMap<String, String>,
    tensors: HashMap<String, TensorInfo>,
}

impl Header {
    async fn read(path: &Path) -> crate::Result<Self> {
        let mut file = File::open(path).await.context(error::FileSnafu)?;
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)
            .await
            .map_err(|_| error::Error::HeaderInvalid {
                reason: "file too short for safetensors header".to_string(),
            })?;
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len > MAX_HEADER_SIZE {
            return error::HeaderTooLargeSnafu { size: header_len }.fail();
        }
        let mut raw = vec![0u8; header_len as usize];
        file.read_exact(&mut raw)
            .await
            .map_err(|_| error::Error::HeaderInvalid {
                reason: "truncated safetensors header".to_string(),
            })?;
        let value: serde_json::Value =
            serde_json::from_slice(raw.as_slice()).map_err(|source| error::Error::HeaderInvalid {
                reason: format!("invalid header json: {source}"),
            })?;
        let serde_json::Value::Object(entries) = value else {
            return error::HeaderInvalidSnafu {
                reason: "header is not a json object",
            }
            .fail();
        };
        let mut metadata = HashMap::new();
        let mut tensors = HashMap::new();
        for (key, value) in entries {
            if key == "__metadata__" {
                if let serde_json::Value::Object(fields) = value {
                    for (name, field) in fields {
                        let rendered = match field {
                            serde_json::Value::String(text) => text,
                            other => other.to_string(),
                        };
                        metadata.insert(name, rendered);
                    }
                }
                continue;
            }
            let tensor: TensorInfo = serde_json::from_value(value).map_err(|source| {
                error::Error::HeaderInvalid {
                    reason: format!("invalid tensor entry '{key}': {source}"),
                }
            })?;
            tensors.insert(key, tensor);
        }
        Ok(Self { metadata, tensors })
    }
}
