use sha2::{Digest as _, Sha256};
use snafu::ResultExt;
use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::digest::Digest;
use crate::error;
use crate::layer::Layer;
use crate::manifest::Manifest;
use crate::model::BaseModel;
use crate::progress::{null_handle, LayerHandle, Tracker, TrackedReader};
use crate::reference::Reference;
use crate::transport::{status_error, RemoteBlob, ResumableTransport};

const INCOMPLETE_SUFFIX: &str = "incomplete";
const TAGS_FILE: &str = "tags.json";
const COPY_BUF_SIZE: usize = 64 * 1024;

pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin> ReadSeek for T {}

/// Where the bytes of a resumable blob write come from.
pub enum BlobSource {
    /// A stream positioned at byte zero
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// A seekable source; resumed writes seek to the sidecar length
    Seekable(Box<dyn ReadSeek>),
    /// A stream already positioned at `offset`, e.g. an HTTP 206 body
    Positioned {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        offset: u64,
    },
}

/// Summary row for one stored model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub digest: Digest,
    pub tags: Vec<String>,
}

/// Content-addressed local model store.
///
/// ```text
/// <root>/
///   blobs/<alg>/<hex>               content-addressed blobs
///   blobs/<alg>/<hex>.incomplete    in-progress writes
///   manifests/<alg>/<hex>           serialized manifest bytes
///   tags.json                       tag -> manifest digest
///   bundles/<alg>/<hex>/            materialized runtime bundles
/// ```
///
/// Concurrent writers of the same digest converge on the same sidecar
/// path and produce identical bytes, so the atomic rename is idempotent;
/// readers never observe a partially renamed blob.
pub struct LocalStore {
    root: PathBuf,
    tags: RwLock<()>,
    pub(crate) bundle_lock: Mutex<()>,
}

impl LocalStore {
    pub async fn new(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))
            .await
            .context(error::DirectorySnafu)?;
        fs::create_dir_all(root.join("manifests"))
            .await
            .context(error::DirectorySnafu)?;
        Ok(Self {
            root,
            tags: RwLock::new(()),
            bundle_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the path of a blob, refusing anything that would escape
    /// the store root.
    pub fn blob_path(&self, digest: &Digest) -> crate::Result<PathBuf> {
        let path = self
            .root
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.hex());
        self.ensure_within_root(path.as_path())?;
        Ok(path)
    }

    fn manifest_path(&self, digest: &Digest) -> crate::Result<PathBuf> {
        let path = self
            .root
            .join("manifests")
            .join(digest.algorithm().to_string())
            .join(digest.hex());
        self.ensure_within_root(path.as_path())?;
        Ok(path)
    }

    pub(crate) fn bundle_dir(&self, digest: &Digest) -> crate::Result<PathBuf> {
        let path = self
            .root
            .join("bundles")
            .join(digest.algorithm().to_string())
            .join(digest.hex());
        self.ensure_within_root(path.as_path())?;
        Ok(path)
    }

    fn ensure_within_root(&self, path: &Path) -> crate::Result<()> {
        let relative = path
            .strip_prefix(self.root.as_path())
            .map_err(|_| error::Error::PathTraversal {
                path: path.display().to_string(),
            })?;
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return error::PathTraversalSnafu {
                path: path.display().to_string(),
            }
            .fail();
        }
        Ok(())
    }

    fn incomplete_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(INCOMPLETE_SUFFIX);
        path.with_file_name(name)
    }

    pub async fn has_blob(&self, digest: &Digest) -> bool {
        match self.blob_path(digest) {
            Ok(path) => fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Drop a poisoned sidecar so the next attempt restarts from zero.
    pub async fn reset_incomplete(&self, digest: &Digest) -> crate::Result<()> {
        let sidecar = Self::incomplete_path(self.blob_path(digest)?.as_path());
        match fs::remove_file(sidecar).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(error::Error::File { source: err }),
        }
    }

    /// Size of the in-progress sidecar for a digest, zero if absent.
    pub async fn incomplete_size(&self, digest: &Digest) -> u64 {
        match self.blob_path(digest) {
            Ok(path) => fs::metadata(Self::incomplete_path(path.as_path()))
                .await
                .map(|metadata| metadata.len())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Write a blob from a stream. A no-op if the blob already exists;
    /// the source is not read in that case. On error the incomplete
    /// sidecar is left behind for a later resume attempt.
    pub async fn write_blob<R>(&self, digest: &Digest, reader: &mut R) -> crate::Result<bool>
    where
        R: AsyncRead + Send + Unpin + ?Sized,
    {
        let final_path = self.blob_path(digest)?;
        if fs::metadata(final_path.as_path()).await.is_ok() {
            trace!(target: "store", "blob {digest} already exists");
            return Ok(false);
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
        }
        let sidecar = Self::incomplete_path(final_path.as_path());
        let mut file = File::create(sidecar.as_path())
            .await
            .context(error::BlobWriteSnafu)?;
        tokio::io::copy(reader, &mut file)
            .await
            .context(error::BlobWriteSnafu)?;
        file.flush().await.context(error::BlobWriteSnafu)?;
        drop(file);
        fs::rename(sidecar.as_path(), final_path.as_path())
            .await
            .context(error::BlobWriteSnafu)?;
        Ok(true)
    }

    /// Write a blob with resume support. An existing sidecar of length
    /// `k` is continued: a seekable source seeks to `k`, a plain stream
    /// discards `k` bytes (restarting from zero if the source is too
    /// short), and a positioned stream appends at its own offset. The
    /// completed file is verified against the expected digest before the
    /// atomic rename; on mismatch the sidecar is deleted so the next
    /// attempt starts clean.
    pub async fn write_blob_resumable(
        &self,
        expected: &Digest,
        source: BlobSource,
        handle: &LayerHandle,
        cancel: &CancellationToken,
    ) -> crate::Result<bool> {
        let final_path = self.blob_path(expected)?;
        if fs::metadata(final_path.as_path()).await.is_ok() {
            trace!(target: "store", "blob {expected} already exists");
            return Ok(false);
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
        }
        let sidecar = Self::incomplete_path(final_path.as_path());
        let existing = fs::metadata(sidecar.as_path())
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);

        let (mut reader, offset): (Box<dyn AsyncRead + Send + Unpin>, u64) = match source {
            BlobSource::Stream(mut reader) => {
                if existing > 0 {
                    let discarded = discard(&mut reader, existing).await?;
                    if discarded < existing {
                        debug!(target: "store", "short source for {expected}, restarting from zero");
                        fs::remove_file(sidecar.as_path())
                            .await
                            .context(error::BlobWriteSnafu)?;
                        (reader, 0)
                    } else {
                        (reader, existing)
                    }
                } else {
                    (reader, 0)
                }
            }
            BlobSource::Seekable(mut reader) => {
                if existing > 0 {
                    reader
                        .seek(SeekFrom::Start(existing))
                        .await
                        .context(error::BlobReadSnafu)?;
                    (Box::new(reader), existing)
                } else {
                    (Box::new(reader), 0)
                }
            }
            BlobSource::Positioned { reader, offset } => {
                if offset > existing {
                    return Err(error::Error::BlobWrite {
                        source: std::io::Error::other(format!(
                            "source resumes at {offset} but only {existing} bytes are on disk"
                        )),
                    });
                }
                (reader, offset)
            }
        };

        // hash the kept prefix so the final digest covers the whole file
        // without a second read of the payload
        let mut hasher = Sha256::new();
        let mut file = if offset > 0 {
            let mut prefix = File::open(sidecar.as_path())
                .await
                .context(error::BlobReadSnafu)?;
            let mut remaining = offset;
            let mut buffer = vec![0u8; COPY_BUF_SIZE];
            while remaining > 0 {
                let want = remaining.min(buffer.len() as u64) as usize;
                let n = prefix
                    .read(&mut buffer[..want])
                    .await
                    .context(error::BlobReadSnafu)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                remaining -= n as u64;
            }
            drop(prefix);
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(sidecar.as_path())
                .await
                .context(error::BlobWriteSnafu)?;
            file.set_len(offset).await.context(error::BlobWriteSnafu)?;
            file.seek(SeekFrom::Start(offset))
                .await
                .context(error::BlobWriteSnafu)?;
            file
        } else {
            File::create(sidecar.as_path())
                .await
                .context(error::BlobWriteSnafu)?
        };

        let mut written = offset;
        let mut buffer = vec![0u8; COPY_BUF_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(error::Error::Interrupted);
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(error::Error::Interrupted),
                read = reader.read(&mut buffer) => read.context(error::BlobReadSnafu)?,
            };
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n])
                .await
                .context(error::BlobWriteSnafu)?;
            written += n as u64;
            handle.update(written);
        }
        file.flush().await.context(error::BlobWriteSnafu)?;
        drop(file);

        let actual = base16::encode_lower(hasher.finalize().as_slice());
        if actual != expected.hex() {
            fs::remove_file(sidecar.as_path())
                .await
                .context(error::BlobWriteSnafu)?;
            return error::DigestMismatchSnafu {
                expected: expected.to_string(),
                actual: format!("sha256:{actual}"),
            }
            .fail();
        }
        fs::rename(sidecar.as_path(), final_path.as_path())
            .await
            .context(error::BlobWriteSnafu)?;
        Ok(true)
    }

    /// Write one layer's blob, skipping the source entirely when the
    /// blob already exists. Returns whether a blob was created and the
    /// layer's diff ID.
    pub async fn write_layer(
        &self,
        layer: &Layer,
        handle: &LayerHandle,
        cancel: &CancellationToken,
    ) -> crate::Result<(bool, Digest)> {
        let diff_id = layer.diff_id().clone();
        if self.has_blob(&diff_id).await {
            handle.update(layer.size());
            return Ok((false, diff_id));
        }
        let reader = layer.uncompressed().await?;
        let reader = TrackedReader::new(reader, handle.clone());
        let created = self
            .write_blob_resumable(&diff_id, BlobSource::Stream(Box::new(reader)), handle, cancel)
            .await?;
        Ok((created, diff_id))
    }

    /// Write the config blob from its raw bytes, once.
    pub async fn write_config(&self, raw: &[u8]) -> crate::Result<(bool, Digest)> {
        let digest = Digest::sha256_bytes(raw);
        let created = self.write_blob(&digest, &mut &raw[..]).await?;
        Ok((created, digest))
    }

    /// Persist a model: every layer blob, the config blob, the manifest
    /// bytes, and optionally a tag.
    pub async fn write(
        &self,
        model: &BaseModel,
        tag: Option<&str>,
        tracker: Option<&Tracker>,
        cancel: &CancellationToken,
    ) -> crate::Result<Digest> {
        for layer in model.layers() {
            let handle = tracker
                .map(|tracker| tracker.register(layer.digest().to_string(), layer.size()))
                .unwrap_or_else(null_handle);
            self.write_layer(layer, &handle, cancel).await?;
            handle.finish().await;
        }
        self.write_config(model.raw_config()).await?;

        let id = model.id()?;
        let manifest_path = self.manifest_path(&id)?;
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
        }
        let staging = Self::incomplete_path(manifest_path.as_path());
        fs::write(staging.as_path(), model.manifest_bytes()?)
            .await
            .context(error::FileSnafu)?;
        fs::rename(staging.as_path(), manifest_path.as_path())
            .await
            .context(error::FileSnafu)?;

        if let Some(tag) = tag {
            self.add_tag(tag, &id).await?;
        }
        debug!(target: "store", "wrote model {id}");
        Ok(id)
    }

    /// Load a stored model by tag, digest, or unambiguous digest prefix.
    pub async fn model(&self, reference: &str) -> crate::Result<BaseModel> {
        let id = self.resolve(reference).await?;
        let manifest_bytes = fs::read(self.manifest_path(&id)?)
            .await
            .map_err(|_| error::Error::ModelNotFound {
                reference: reference.to_string(),
            })?;
        let manifest = Manifest::from_bytes(manifest_bytes.as_slice())?;
        let raw_config = fs::read(self.blob_path(&manifest.config.digest)?)
            .await
            .context(error::BlobReadSnafu)?;
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in manifest.layers.iter() {
            let path = self.blob_path(&descriptor.digest)?;
            layers.push(Layer::from_blob(descriptor.clone(), path));
        }
        BaseModel::from_stored(raw_config, manifest_bytes, layers)
    }

    /// Resolve a tag, a full digest, or a digest hex prefix that is
    /// unambiguous within the store.
    pub async fn resolve(&self, reference: &str) -> crate::Result<Digest> {
        let tags = self.read_tags().await?;
        if let Some(digest) = tags.get(reference) {
            return Digest::from_str(digest.as_str());
        }
        if let Ok(digest) = Digest::from_str(reference) {
            return Ok(digest);
        }
        let prefix = reference.strip_prefix("sha256:").unwrap_or(reference);
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return error::ModelNotFoundSnafu {
                reference: reference.to_string(),
            }
            .fail();
        }
        let mut matches = HashSet::new();
        for summary in self.list().await? {
            if summary.digest.hex().starts_with(prefix) {
                matches.insert(summary.digest.to_string());
            }
        }
        match matches.len() {
            0 => error::ModelNotFoundSnafu {
                reference: reference.to_string(),
            }
            .fail(),
            1 => Digest::from_str(matches.into_iter().next().expect("one match").as_str()),
            _ => error::AmbiguousReferenceSnafu {
                reference: reference.to_string(),
            }
            .fail(),
        }
    }

    /// Enumerate stored manifests with their tags.
    pub async fn list(&self) -> crate::Result<Vec<ModelSummary>> {
        let tags = self.read_tags().await?;
        let mut by_digest: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tag, digest) in tags.iter() {
            by_digest.entry(digest.clone()).or_default().push(tag.clone());
        }
        let mut summaries = Vec::new();
        let manifests = self.root.join("manifests");
        let mut algorithms = match fs::read_dir(manifests.as_path()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(summaries),
        };
        while let Some(algorithm) = algorithms.next_entry().await.context(error::DirectorySnafu)? {
            let mut entries = fs::read_dir(algorithm.path())
                .await
                .context(error::DirectorySnafu)?;
            while let Some(entry) = entries.next_entry().await.context(error::DirectorySnafu)? {
                let digest = format!(
                    "{}:{}",
                    algorithm.file_name().to_string_lossy(),
                    entry.file_name().to_string_lossy()
                );
                let Ok(digest) = Digest::from_str(digest.as_str()) else {
                    continue;
                };
                summaries.push(ModelSummary {
                    tags: by_digest.get(digest.to_string().as_str()).cloned().unwrap_or_default(),
                    digest,
                });
            }
        }
        Ok(summaries)
    }

    async fn read_tags(&self) -> crate::Result<BTreeMap<String, String>> {
        let _shared = self.tags.read().await;
        self.read_tags_unlocked().await
    }

    async fn read_tags_unlocked(&self) -> crate::Result<BTreeMap<String, String>> {
        let path = self.root.join(TAGS_FILE);
        match fs::read(path.as_path()).await {
            Ok(raw) => serde_json::from_slice(raw.as_slice()).context(error::TagsDeserializeSnafu),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(error::Error::File { source: err }),
        }
    }

    async fn write_tags(&self, tags: &BTreeMap<String, String>) -> crate::Result<()> {
        let path = self.root.join(TAGS_FILE);
        let staging = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(tags).context(error::SerializeSnafu)?;
        fs::write(staging.as_path(), raw.as_slice())
            .await
            .context(error::FileSnafu)?;
        fs::rename(staging.as_path(), path.as_path())
            .await
            .context(error::FileSnafu)?;
        Ok(())
    }

    pub async fn tags(&self) -> crate::Result<BTreeMap<String, String>> {
        self.read_tags().await
    }

    pub async fn add_tag(&self, tag: &str, digest: &Digest) -> crate::Result<()> {
        let _exclusive = self.tags.write().await;
        let mut tags = self.read_tags_unlocked().await?;
        tags.insert(tag.to_string(), digest.to_string());
        self.write_tags(&tags).await
    }

    /// Remove a tag. Dropping the last tag of a manifest deletes the
    /// manifest and garbage-collects blobs nothing references anymore.
    pub async fn remove_tag(&self, tag: &str) -> crate::Result<()> {
        let digest = {
            let _exclusive = self.tags.write().await;
            let mut tags = self.read_tags_unlocked().await?;
            let Some(digest) = tags.remove(tag) else {
                return error::ModelNotFoundSnafu {
                    reference: tag.to_string(),
                }
                .fail();
            };
            self.write_tags(&tags).await?;
            if tags.values().any(|remaining| *remaining == digest) {
                return Ok(());
            }
            Digest::from_str(digest.as_str())?
        };
        let manifest_path = self.manifest_path(&digest)?;
        if let Err(err) = fs::remove_file(manifest_path.as_path()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(error::Error::File { source: err });
            }
        }
        let bundle = self.bundle_dir(&digest)?;
        let _ = fs::remove_dir_all(bundle.as_path()).await;
        self.collect_garbage().await?;
        Ok(())
    }

    /// Delete every blob no manifest references. Sidecars of collected
    /// blobs go with them.
    pub async fn collect_garbage(&self) -> crate::Result<usize> {
        let mut referenced: HashSet<String> = HashSet::new();
        for summary in self.list().await? {
            let manifest_bytes = fs::read(self.manifest_path(&summary.digest)?)
                .await
                .context(error::FileSnafu)?;
            let manifest = Manifest::from_bytes(manifest_bytes.as_slice())?;
            referenced.insert(manifest.config.digest.hex().to_string());
            for layer in manifest.layers.iter() {
                referenced.insert(layer.digest.hex().to_string());
            }
        }
        let mut removed = 0;
        let blobs = self.root.join("blobs");
        let mut algorithms = match fs::read_dir(blobs.as_path()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Some(algorithm) = algorithms.next_entry().await.context(error::DirectorySnafu)? {
            let mut entries = fs::read_dir(algorithm.path())
                .await
                .context(error::DirectorySnafu)?;
            while let Some(entry) = entries.next_entry().await.context(error::DirectorySnafu)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let hex = name.split('.').next().unwrap_or(name.as_str());
                if !referenced.contains(hex) {
                    fs::remove_file(entry.path())
                        .await
                        .context(error::FileSnafu)?;
                    removed += 1;
                }
            }
        }
        debug!(target: "store", "garbage collected {removed} blobs");
        Ok(removed)
    }

    /// Pull a model from a registry through the resumable transport,
    /// writing blobs with progress, and return the stored model.
    pub async fn pull(
        &self,
        reference: &Reference,
        transport: Arc<ResumableTransport>,
        tracker: Option<&Tracker>,
        cancel: &CancellationToken,
    ) -> crate::Result<BaseModel> {
        let manifest_url = reference.manifest_url()?;
        let response = transport.get(&manifest_url).await?;
        if !response.status.is_success() {
            return Err(status_error(response.status, manifest_url.path()));
        }
        let mut body = response.body;
        let mut manifest_bytes = Vec::new();
        body.read_to_end(&mut manifest_bytes)
            .await
            .context(error::BlobReadSnafu)?;
        let manifest = Manifest::from_bytes(manifest_bytes.as_slice())?;

        // config blob
        let raw_config = if self.has_blob(&manifest.config.digest).await {
            fs::read(self.blob_path(&manifest.config.digest)?)
                .await
                .context(error::BlobReadSnafu)?
        } else {
            let blob = self.fetch_blob_bytes(reference, &transport, &manifest.config.digest).await?;
            self.write_blob(&manifest.config.digest, &mut blob.as_slice())
                .await?;
            blob
        };

        // layer blobs, resumable, with progress
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in manifest.layers.iter() {
            let handle = tracker
                .map(|tracker| tracker.register(descriptor.digest.to_string(), descriptor.size))
                .unwrap_or_else(null_handle);
            if !self.has_blob(&descriptor.digest).await {
                let offset = self.incomplete_size(&descriptor.digest).await;
                transport.set_offset(&descriptor.digest, offset);
                let remote = RemoteBlob::new(
                    transport.clone(),
                    reference.blob_url(&descriptor.digest)?,
                    descriptor.digest.clone(),
                );
                let reader = remote.open().await?;
                let reader: Box<dyn AsyncRead + Send + Unpin> =
                    Box::new(TrackedReader::new(reader, handle.clone()));
                let source = if transport.did_resume(&descriptor.digest) {
                    BlobSource::Positioned { reader, offset }
                } else {
                    BlobSource::Stream(reader)
                };
                self.write_blob_resumable(&descriptor.digest, source, &handle, cancel)
                    .await?;
            }
            handle.finish().await;
            layers.push(Layer::from_blob(
                descriptor.clone(),
                self.blob_path(&descriptor.digest)?,
            ));
        }

        let model = BaseModel::from_stored(raw_config, manifest_bytes, layers)?;
        let id = self
            .write(&model, Some(reference.to_string().as_str()), None, cancel)
            .await?;
        if let Some(tracker) = tracker {
            tracker.wait().await?;
            tracker
                .success(format!("pulled {reference} ({id})"))
                .await?;
        }
        Ok(model)
    }

    async fn fetch_blob_bytes(
        &self,
        reference: &Reference,
        transport: &Arc<ResumableTransport>,
        digest: &Digest,
    ) -> crate::Result<Vec<u8>> {
        let url: Url = reference.blob_url(digest)?;
        let response = transport.get(&url).await?;
        if !response.status.is_success() {
            return Err(status_error(response.status, url.path()));
        }
        let mut body = response.body;
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)
            .await
            .context(error::BlobReadSnafu)?;
        let actual = Digest::sha256_bytes(bytes.as_slice());
        if actual != *digest {
            return error::DigestMismatchSnafu {
                expected: digest.to_string(),
                actual: actual.to_string(),
            }
            .fail();
        }
        Ok(bytes)
    }
}

/// Read and drop up to `count` bytes, returning how many were consumed.
async fn discard<R>(reader: &mut R, count: u64) -> crate::Result<u64>
where
    R: AsyncRead + Send + Unpin + ?Sized,
{
    let mut remaining = count;
    let mut buffer = vec![0u8; COPY_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = reader
            .read(&mut buffer[..want])
            .await
            .context(error::BlobReadSnafu)?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(count - remaining)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use tokio_util::sync::CancellationToken;

    use crate::builder::Builder;
    use crate::digest::Digest;
    use crate::format::gguf;
    use crate::progress::null_handle;

    use super::{BlobSource, LocalStore};

    const PAYLOAD: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz ABCDE";

    async fn store() -> (tempfile::TempDir, LocalStore) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_blob_idempotent() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        assert!(store.write_blob(&digest, &mut &PAYLOAD[..]).await.unwrap());
        // second write is a no-op
        assert!(!store.write_blob(&digest, &mut &PAYLOAD[..]).await.unwrap());
        let path = store.blob_path(&digest).unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), PAYLOAD);
        // no sidecar left behind
        let sidecar = LocalStore::incomplete_path(store.blob_path(&digest).unwrap().as_path());
        assert!(tokio::fs::metadata(sidecar).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writes_converge() {
        let (_guard, store) = store().await;
        let store = std::sync::Arc::new(store);
        let digest = Digest::sha256_bytes(PAYLOAD);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let digest = digest.clone();
            tasks.push(tokio::spawn(async move {
                store.write_blob(&digest, &mut &PAYLOAD[..]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let path = store.blob_path(&digest).unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn test_resume_from_sidecar() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        // pre-place a sidecar holding the first 10 bytes
        let path = store.blob_path(&digest).unwrap();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let sidecar = LocalStore::incomplete_path(path.as_path());
        tokio::fs::write(sidecar.as_path(), &PAYLOAD[..10]).await.unwrap();

        let created = store
            .write_blob_resumable(
                &digest,
                BlobSource::Stream(Box::new(&PAYLOAD[..])),
                &null_handle(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(created);
        assert_eq!(tokio::fs::read(path).await.unwrap(), PAYLOAD);
        assert!(tokio::fs::metadata(sidecar).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_with_seekable_source() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        let path = store.blob_path(&digest).unwrap();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let sidecar = LocalStore::incomplete_path(path.as_path());
        tokio::fs::write(sidecar.as_path(), &PAYLOAD[..20]).await.unwrap();

        let source = std::io::Cursor::new(PAYLOAD.to_vec());
        store
            .write_blob_resumable(
                &digest,
                BlobSource::Seekable(Box::new(source)),
                &null_handle(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn test_bad_prefix_never_corrupts_final() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        let path = store.blob_path(&digest).unwrap();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let sidecar = LocalStore::incomplete_path(path.as_path());
        // sidecar prefix that does NOT match the source bytes
        tokio::fs::write(sidecar.as_path(), b"XXXXXXXXXX").await.unwrap();

        let err = store
            .write_blob_resumable(
                &digest,
                BlobSource::Stream(Box::new(&PAYLOAD[..])),
                &null_handle(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::DigestMismatch { .. }));
        // never a corrupted final blob
        assert!(tokio::fs::metadata(path).await.is_err());
    }

    #[tokio::test]
    async fn test_short_source_restarts_from_zero() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        let path = store.blob_path(&digest).unwrap();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let sidecar = LocalStore::incomplete_path(path.as_path());
        // sidecar longer than what a fresh source would discard
        let mut long = PAYLOAD.to_vec();
        long.extend_from_slice(b"tail");
        tokio::fs::write(sidecar.as_path(), long.as_slice()).await.unwrap();

        // short source: discard hits EOF, the write restarts from zero
        // and fails verification against the now-empty stream
        let err = store
            .write_blob_resumable(
                &digest,
                BlobSource::Stream(Box::new(&PAYLOAD[..])),
                &null_handle(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::DigestMismatch { .. }));
        assert!(tokio::fs::metadata(path).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_preserves_sidecar() {
        let (_guard, store) = store().await;
        let digest = Digest::sha256_bytes(PAYLOAD);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .write_blob_resumable(
                &digest,
                BlobSource::Stream(Box::new(&PAYLOAD[..])),
                &null_handle(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Interrupted));
        // the empty sidecar stays for the next attempt
        let sidecar = LocalStore::incomplete_path(store.blob_path(&digest).unwrap().as_path());
        assert!(tokio::fs::metadata(sidecar).await.is_ok());
        store.reset_incomplete(&digest).await.unwrap();
        assert!(tokio::fs::metadata(
            LocalStore::incomplete_path(store.blob_path(&digest).unwrap().as_path())
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_write_and_load_model() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[4]], |_| 0))
            .await
            .unwrap();
        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        let id = store
            .write(&model, Some("smollm:latest"), None, &CancellationToken::new())
            .await
            .unwrap();

        // content-addressed integrity: blob under the digest matches
        let manifest = model.manifest().unwrap();
        for descriptor in manifest.layers.iter() {
            let blob = tokio::fs::read(store.blob_path(&descriptor.digest).unwrap())
                .await
                .unwrap();
            assert_eq!(blob.len() as u64, descriptor.size);
            assert_eq!(Digest::sha256_bytes(blob.as_slice()), descriptor.digest);
        }

        // load back by tag, by digest, and by prefix
        let loaded = store.model("smollm:latest").await.unwrap();
        assert_eq!(loaded.id().unwrap(), id);
        let loaded = store.model(id.to_string().as_str()).await.unwrap();
        assert_eq!(loaded.id().unwrap(), id);
        let loaded = store.model(&id.hex()[..12]).await.unwrap();
        assert_eq!(loaded.id().unwrap(), id);
        // manifest bytes were persisted verbatim
        assert_eq!(loaded.manifest_bytes().unwrap(), model.manifest_bytes().unwrap());

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].tags, vec!["smollm:latest".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_last_tag_collects_blobs() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[4]], |_| 0))
            .await
            .unwrap();
        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        let id = store
            .write(&model, Some("keep"), None, &CancellationToken::new())
            .await
            .unwrap();
        store.add_tag("also", &id).await.unwrap();

        // removing one of two tags keeps everything
        store.remove_tag("also").await.unwrap();
        assert!(store.model("keep").await.is_ok());

        // removing the last tag drops the manifest and its blobs
        store.remove_tag("keep").await.unwrap();
        assert!(store.model("keep").await.is_err());
        assert!(store.model(id.to_string().as_str()).await.is_err());
        let layer_digest = model.layers()[0].digest();
        assert!(!store.has_blob(layer_digest).await);
    }

    #[tokio::test]
    async fn test_blob_path_rejects_traversal() {
        // a digest cannot carry traversal, so force a bad root-relative
        // layout through the validator directly
        let (_guard, store) = store().await;
        let digest =
            Digest::from_str("sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert!(store.blob_path(&digest).is_ok());
        let outside = store.root().join("..").join("escape");
        assert!(store.ensure_within_root(outside.as_path()).is_err());
    }

    #[tokio::test]
    async fn test_prefix_resolution() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();
        for (name, dims) in [("a.gguf", 4u64), ("b.gguf", 8u64)] {
            let weight = dir.path().join(name);
            tokio::fs::write(
                weight.as_path(),
                gguf::test::fixture(&[&[dims]], |_| 0),
            )
            .await
            .unwrap();
            let model = Builder::from_path(weight.as_path())
                .await
                .unwrap()
                .build()
                .unwrap();
            let id = store
                .write(&model, Some(name), None, &CancellationToken::new())
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(store.resolve("").await.is_err());
        assert!(store.resolve("zz").await.is_err());

        // a prefix shared by both digests is ambiguous; one unique to
        // the first digest resolves to it
        let (first, second) = (ids[0].hex(), ids[1].hex());
        let common = first
            .bytes()
            .zip(second.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        if common > 0 {
            let err = store.resolve(&first[..common]).await.unwrap_err();
            assert!(matches!(err, crate::error::Error::AmbiguousReference { .. }));
        }
        let resolved = store.resolve(&first[..common + 1]).await.unwrap();
        assert_eq!(resolved, ids[0]);
    }
}
