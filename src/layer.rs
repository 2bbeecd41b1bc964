use chrono::{DateTime, Utc};
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::AsyncRead;

use crate::digest::{self, Digest};
use crate::error;
use crate::manifest::{
    Descriptor, FileMetadata, ANNOTATION_FILEPATH, ANNOTATION_FILE_METADATA,
    ANNOTATION_MEDIA_TYPE_UNTESTED, TYPEFLAG_REGULAR,
};
use crate::mediatype::MediaType;
use crate::transport::RemoteBlob;

/// Where a layer's bytes live. A layer exclusively owns either a local
/// file or a remote blob handle; never both.
#[derive(Clone)]
pub enum LayerSource {
    File {
        path: PathBuf,
        /// Keeps builder staging directories alive until the layer is
        /// persisted to a store.
        scratch: Option<Arc<TempDir>>,
    },
    Remote(RemoteBlob),
}

/// One content-addressed layer of a model artifact. Layers are stored
/// uncompressed, so the digest doubles as the diff ID.
#[derive(Clone)]
pub struct Layer {
    descriptor: Descriptor,
    source: LayerSource,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Layer {
    /// Create a layer from an on-disk file: stream it through sha256,
    /// capture its file metadata, and annotate the forward-slash
    /// relative path it should unpack to.
    pub async fn from_file(
        path: impl Into<PathBuf>,
        media_type: MediaType,
        relative_path: impl AsRef<str>,
    ) -> crate::Result<Self> {
        let path = path.into();
        let mut file = File::open(path.as_path()).await.context(error::FileSnafu)?;
        let (digest, size) = digest::sha256_stream(&mut file)
            .await
            .context(error::LayerReadSnafu)?;
        let metadata = tokio::fs::metadata(path.as_path())
            .await
            .context(error::FileSnafu)?;
        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let relative = normalize_relative(relative_path.as_ref());
        let file_metadata = FileMetadata {
            name: relative.clone(),
            mode: permissions_mode(&metadata),
            uid: 0,
            gid: 0,
            size,
            mtime,
            typeflag: TYPEFLAG_REGULAR,
        };
        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_FILEPATH.to_string(), relative);
        annotations.insert(
            ANNOTATION_FILE_METADATA.to_string(),
            serde_json::to_string(&file_metadata).context(error::SerializeSnafu)?,
        );
        annotations.insert(
            ANNOTATION_MEDIA_TYPE_UNTESTED.to_string(),
            "false".to_string(),
        );
        Ok(Self {
            descriptor: Descriptor {
                media_type,
                size,
                digest,
                annotations: Some(annotations),
                urls: None,
                platform: None,
            },
            source: LayerSource::File {
                path,
                scratch: None,
            },
        })
    }

    /// Wrap a blob already present in a local store
    pub fn from_blob(descriptor: Descriptor, path: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            source: LayerSource::File {
                path: path.into(),
                scratch: None,
            },
        }
    }

    /// Wrap a blob addressable through a transport
    pub fn from_remote(descriptor: Descriptor, remote: RemoteBlob) -> Self {
        Self {
            descriptor,
            source: LayerSource::Remote(remote),
        }
    }

    /// Keep a staging directory alive for as long as this layer is
    pub(crate) fn retain_scratch(&mut self, scratch: Arc<TempDir>) {
        if let LayerSource::File {
            scratch: slot,
            ..
        } = &mut self.source
        {
            *slot = Some(scratch);
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn media_type(&self) -> &MediaType {
        &self.descriptor.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    /// Digest of the uncompressed content. Layers are stored
    /// uncompressed, so this equals the digest.
    pub fn diff_id(&self) -> &Digest {
        &self.descriptor.digest
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Relative bundle path recorded at construction, if any
    pub fn filepath(&self) -> Option<&str> {
        self.descriptor.filepath()
    }

    /// Local file backing this layer. Remote-only layers must be
    /// materialized through a store before a path exists.
    pub fn path(&self) -> crate::Result<&Path> {
        match &self.source {
            LayerSource::File { path, .. } => Ok(path.as_path()),
            LayerSource::Remote(remote) => error::LayerMissingLocallySnafu {
                digest: remote.digest().to_string(),
            }
            .fail(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, LayerSource::File { .. })
    }

    /// Open the layer content as a byte stream
    pub async fn uncompressed(&self) -> crate::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            LayerSource::File { path, .. } => {
                let file = File::open(path.as_path()).await.context(error::FileSnafu)?;
                Ok(Box::new(file))
            }
            LayerSource::Remote(remote) => remote.open().await,
        }
    }
}

/// Store annotations with forward slashes regardless of host separator
fn normalize_relative(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.trim_start_matches('/').to_string()
}

#[cfg(unix)]
fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
