use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashMap;

use crate::digest::Digest;
use crate::error;
use crate::mediatype::MediaType;

/// Annotation holding the forward-slash relative path of a layer's file
/// within the model bundle.
pub const ANNOTATION_FILEPATH: &str = "org.cncf.model.filepath";
/// Annotation holding serialized file metadata for a layer.
pub const ANNOTATION_FILE_METADATA: &str = "org.cncf.model.file.metadata+json";
/// Annotation marking whether the layer media type was assigned without
/// inspecting the file contents.
pub const ANNOTATION_MEDIA_TYPE_UNTESTED: &str = "org.cncf.model.file.mediatype.untested";

/// Tar typeflag for a regular file
pub const TYPEFLAG_REGULAR: u8 = b'0';

/// Platform hint carried on a descriptor. Model artifacts are platform
/// independent so this is rarely populated, but descriptors from other
/// tooling may carry it.
#[derive(Builder, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[builder(setter(into))]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// File metadata preserved alongside a layer so the unpacker can restore
/// the original name and mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub typeflag: u8,
}

/// A content descriptor pairing a digest with its media type, size, and
/// semantic annotations.
#[derive(Builder, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[builder(setter(into, strip_option), default)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: MediaType,
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            media_type: MediaType::ModelFile,
            size: 0,
            digest: Digest::sha256_bytes(b""),
            annotations: None,
            urls: None,
            platform: None,
        }
    }
}

impl Descriptor {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|map| map.get(key))
            .map(String::as_str)
    }

    /// Relative bundle path of this layer, if annotated
    pub fn filepath(&self) -> Option<&str> {
        self.annotation(ANNOTATION_FILEPATH)
    }

    /// Decode the file metadata annotation, if present and well-formed
    pub fn file_metadata(&self) -> Option<FileMetadata> {
        self.annotation(ANNOTATION_FILE_METADATA)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// An OCI image manifest specialized to model artifacts: a config blob
/// descriptor plus one descriptor per layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: usize,
    pub media_type: MediaType,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MediaType::Manifest,
            config,
            layers,
            annotations: None,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).context(error::ManifestDeserializeSnafu)
    }

    /// Serialize this manifest. The bytes produced here are persisted
    /// verbatim; the model ID is the sha256 of exactly these bytes and is
    /// never recomputed from a later re-serialization.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).context(error::SerializeSnafu)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::str::FromStr;

    use crate::digest::Digest;
    use crate::mediatype::MediaType;

    use super::{Descriptor, Manifest, ANNOTATION_FILEPATH};

    fn descriptor(media_type: MediaType, path: Option<&str>) -> Descriptor {
        let mut annotations = HashMap::new();
        if let Some(path) = path {
            annotations.insert(ANNOTATION_FILEPATH.to_string(), path.to_string());
        }
        Descriptor {
            media_type,
            size: 16,
            digest: Digest::sha256_bytes(b"fixture"),
            annotations: (!annotations.is_empty()).then_some(annotations),
            urls: None,
            platform: None,
        }
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = Manifest::new(
            descriptor(MediaType::ConfigV02, None),
            vec![descriptor(MediaType::Gguf, Some("model.gguf"))],
        );
        let bytes = manifest.to_bytes().unwrap();
        let parsed = Manifest::from_bytes(bytes.as_slice()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.schema_version, 2);
        assert_eq!(parsed.layers[0].filepath(), Some("model.gguf"));

        // wire field names follow the OCI spec
        let value: serde_json::Value = serde_json::from_slice(bytes.as_slice()).unwrap();
        assert!(value.get("schemaVersion").is_some());
        assert_eq!(
            value["mediaType"],
            "application/vnd.oci.image.manifest.v1+json"
        );
    }

    #[test]
    fn test_descriptor_digest_serde() {
        let descriptor = descriptor(MediaType::Safetensors, None);
        let json = serde_json::to_string(&descriptor).unwrap();
        let parsed: Descriptor = serde_json::from_str(json.as_str()).unwrap();
        assert_eq!(
            parsed.digest,
            Digest::from_str(descriptor.digest.to_string().as_str()).unwrap()
        );
    }
}
