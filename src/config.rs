use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashMap;

use crate::digest::Digest;
use crate::error;
use crate::format::Format;

/// Docker-style model configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub config: Config,
    #[serde(default)]
    pub descriptor: ConfigDescriptor,
    pub rootfs: RootFs,
}

/// Model capabilities section of a Docker-style config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gguf: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safetensors: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffusers: Option<DiffusersInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u64>,
}

/// Diffusers-specific layout details for DDUF artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffusersInfo {
    pub layout: String,
    pub dduf_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// CNCF ModelPack configuration blob. Field names on the wire are
/// camelCase with a handful of all-caps URL suffixes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageConfigFile {
    pub descriptor: PackageDescriptor,
    pub modelfs: ModelFs,
    pub config: PackageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "docURL", skip_serializing_if = "Option::is_none")]
    pub doc_url: Option<String>,
    #[serde(rename = "sourceURL", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(rename = "datasetsURL", skip_serializing_if = "Vec::is_empty")]
    pub datasets_url: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(rename = "diffIds", default)]
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<PackageCapabilities>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageCapabilities {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_cutoff: Option<String>,
    pub reasoning: bool,
    pub tool_usage: bool,
    pub reward: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
}

/// The unified capability view exposed by both dialects. This is what the
/// runtime consumes as the bundle's `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub format: Format,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u64>,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub quantization: String,
}

/// A parsed model config in either dialect. The raw bytes the config was
/// parsed from are kept by the owning model so the manifest digest stays
/// stable across loads.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelConfigFile {
    Docker(ConfigFile),
    Package(PackageConfigFile),
}

impl ModelConfigFile {
    /// Detect the dialect structurally and parse. ModelPack configs are
    /// recognized by `config.paramSize`, `descriptor.createdAt`, or a
    /// top-level `modelfs` key; anything else parses as Docker-style.
    pub fn from_raw(raw: &[u8]) -> crate::Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).context(error::ConfigDeserializeSnafu)?;
        let is_package = value.pointer("/config/paramSize").is_some()
            || value.pointer("/descriptor/createdAt").is_some()
            || value.get("modelfs").is_some();
        if is_package {
            let parsed = serde_json::from_value(value).context(error::ConfigDeserializeSnafu)?;
            Ok(Self::Package(parsed))
        } else {
            let parsed = serde_json::from_value(value).context(error::ConfigDeserializeSnafu)?;
            Ok(Self::Docker(parsed))
        }
    }

    /// Layer diff IDs in manifest layer order
    pub fn diff_ids(&self) -> &[Digest] {
        match self {
            Self::Docker(file) => file.rootfs.diff_ids.as_slice(),
            Self::Package(file) => file.modelfs.diff_ids.as_slice(),
        }
    }

    /// Unified capability set. ModelPack has no context-size field so
    /// that side always reports none.
    pub fn model_config(&self) -> ModelConfig {
        match self {
            Self::Docker(file) => ModelConfig {
                format: file.config.format.clone().unwrap_or_default(),
                context_size: file.config.context_size,
                size: file.config.size.clone().unwrap_or_default(),
                architecture: file.config.architecture.clone().unwrap_or_default(),
                parameters: file.config.parameters.clone().unwrap_or_default(),
                quantization: file.config.quantization.clone().unwrap_or_default(),
            },
            Self::Package(file) => ModelConfig {
                format: file.config.format.clone().unwrap_or_default(),
                context_size: None,
                size: String::new(),
                architecture: file.config.architecture.clone().unwrap_or_default(),
                parameters: file.config.param_size.clone().unwrap_or_default(),
                quantization: file.config.quantization.clone().unwrap_or_default(),
            },
        }
    }
}
