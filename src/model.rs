use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::{ModelConfig, ModelConfigFile};
use crate::digest::Digest;
use crate::layer::Layer;
use crate::manifest::{Descriptor, Manifest};
use crate::mediatype::MediaType;

/// An in-memory model artifact: a config blob plus an ordered list of
/// layers. The manifest is serialized at most once per model; its bytes
/// are reused for every subsequent ID computation so the ID never
/// drifts across re-serializations.
pub struct BaseModel {
    raw_config: Vec<u8>,
    config: ModelConfigFile,
    config_media_type: MediaType,
    layers: Vec<Layer>,
    manifest_raw: OnceLock<Vec<u8>>,
}

impl BaseModel {
    /// Assemble a model from serialized config bytes and its layers.
    pub fn new(
        raw_config: Vec<u8>,
        config_media_type: MediaType,
        layers: Vec<Layer>,
    ) -> crate::Result<Self> {
        let config = ModelConfigFile::from_raw(raw_config.as_slice())?;
        Ok(Self {
            raw_config,
            config,
            config_media_type,
            layers,
            manifest_raw: OnceLock::new(),
        })
    }

    /// Rehydrate a model that was read back from a store, keeping the
    /// persisted manifest bytes so the ID stays stable.
    pub fn from_stored(
        raw_config: Vec<u8>,
        manifest_bytes: Vec<u8>,
        layers: Vec<Layer>,
    ) -> crate::Result<Self> {
        let manifest = Manifest::from_bytes(manifest_bytes.as_slice())?;
        let config = ModelConfigFile::from_raw(raw_config.as_slice())?;
        let manifest_raw = OnceLock::new();
        let _ = manifest_raw.set(manifest_bytes);
        Ok(Self {
            raw_config,
            config,
            config_media_type: manifest.config.media_type,
            layers,
            manifest_raw,
        })
    }

    pub fn layers(&self) -> &[Layer] {
        self.layers.as_slice()
    }

    pub fn config_media_type(&self) -> &MediaType {
        &self.config_media_type
    }

    /// Serialized config blob bytes, exactly as persisted
    pub fn raw_config(&self) -> &[u8] {
        self.raw_config.as_slice()
    }

    pub fn config_file(&self) -> &ModelConfigFile {
        &self.config
    }

    /// Unified capability view across config dialects
    pub fn model_config(&self) -> ModelConfig {
        self.config.model_config()
    }

    fn config_descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.config_media_type.clone(),
            size: self.raw_config.len() as u64,
            digest: Digest::sha256_bytes(self.raw_config.as_slice()),
            annotations: None,
            urls: None,
            platform: None,
        }
    }

    pub fn manifest(&self) -> crate::Result<Manifest> {
        Manifest::from_bytes(self.manifest_bytes()?)
    }

    /// Serialized manifest bytes. Computed once and cached; models read
    /// back from a store carry the persisted bytes instead.
    pub fn manifest_bytes(&self) -> crate::Result<&[u8]> {
        if let Some(bytes) = self.manifest_raw.get() {
            return Ok(bytes.as_slice());
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.descriptor().clone())
            .collect();
        let manifest = Manifest::new(self.config_descriptor(), layers);
        let bytes = manifest.to_bytes()?;
        // A concurrent caller may have set it first; either value is
        // identical since the inputs are immutable.
        let _ = self.manifest_raw.set(bytes);
        Ok(self
            .manifest_raw
            .get()
            .expect("manifest bytes just set")
            .as_slice())
    }

    /// The model ID: sha256 over the persisted manifest bytes
    pub fn id(&self) -> crate::Result<Digest> {
        Ok(Digest::sha256_bytes(self.manifest_bytes()?))
    }

    /// Layers whose media type matches the target, honoring the
    /// Docker ↔ ModelPack weight-type equivalence.
    pub fn layers_by_media_type(&self, target: &MediaType) -> Vec<&Layer> {
        self.layers
            .iter()
            .filter(|layer| target.matches(layer.media_type()))
            .collect()
    }

    fn weight_paths(&self, target: &MediaType) -> crate::Result<Vec<PathBuf>> {
        self.layers_by_media_type(target)
            .into_iter()
            .map(|layer| layer.path().map(PathBuf::from))
            .collect()
    }

    pub fn gguf_paths(&self) -> crate::Result<Vec<PathBuf>> {
        self.weight_paths(&MediaType::Gguf)
    }

    pub fn safetensors_paths(&self) -> crate::Result<Vec<PathBuf>> {
        self.weight_paths(&MediaType::Safetensors)
    }

    pub fn dduf_paths(&self) -> crate::Result<Vec<PathBuf>> {
        self.weight_paths(&MediaType::Dduf)
    }

    fn single_layer(&self, target: &MediaType) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|layer| target.matches(layer.media_type()))
    }

    pub fn mmproj_layer(&self) -> Option<&Layer> {
        self.single_layer(&MediaType::Mmproj)
    }

    pub fn chat_template_layer(&self) -> Option<&Layer> {
        self.single_layer(&MediaType::ChatTemplate)
    }

    pub fn config_archive_layer(&self) -> Option<&Layer> {
        self.single_layer(&MediaType::ConfigArchive)
    }

    /// Total size of the artifact's layers in bytes
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(Layer::size).sum()
    }
}
