use chrono::{DateTime, Utc};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio_tar::Builder as ArchiveBuilder;
use walkdir::WalkDir;

use crate::classify;
use crate::config::{Config, ConfigDescriptor, ConfigFile, ModelConfigFile, RootFs};
use crate::digest::Digest;
use crate::error;
use crate::format::{self, Format, FormatRegistry};
use crate::layer::Layer;
use crate::mediatype::MediaType;
use crate::model::BaseModel;

/// Options for building a model from a directory walk.
#[derive(Debug, Clone, Default)]
pub struct DirectoryOptions {
    /// Exclusion patterns, see [`Builder::from_directory`]
    pub exclusions: Vec<String>,
}

/// Assembles a [`BaseModel`] from local files, directories, or an
/// existing model. Every mutation consumes the builder and returns a new
/// one, so partially applied chains never leak into a built model. A
/// builder created with [`Builder::from_model`] keeps a snapshot of the
/// original layer digests for [`Builder::has_only_config_changes`].
pub struct Builder {
    registry: FormatRegistry,
    config: Config,
    created: Option<DateTime<Utc>>,
    config_media_type: MediaType,
    layers: Vec<Layer>,
    original_layers: Option<Vec<Digest>>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("created", &self.created)
            .field("config_media_type", &self.config_media_type)
            .field("layers", &self.layers)
            .field("original_layers", &self.original_layers)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Build from a single weight file, expanding it to its full shard
    /// set when the filename follows the shard naming convention.
    pub async fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::from_path_with(FormatRegistry::default(), path).await
    }

    pub async fn from_path_with(
        registry: FormatRegistry,
        path: impl AsRef<Path>,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        let format = format::detect(path)?;
        let shards = registry.adapter(&format)?.discover_shards(path)?;
        Self::from_weights(registry, format, shards).await
    }

    /// Build from an explicit, non-empty, format-homogeneous path list.
    pub async fn from_paths(paths: &[PathBuf]) -> crate::Result<Self> {
        Self::from_paths_with(FormatRegistry::default(), paths).await
    }

    pub async fn from_paths_with(
        registry: FormatRegistry,
        paths: &[PathBuf],
    ) -> crate::Result<Self> {
        let format = format::detect_all(paths)?;
        Self::from_weights(registry, format, paths.to_vec()).await
    }

    async fn from_weights(
        registry: FormatRegistry,
        format: Format,
        paths: Vec<PathBuf>,
    ) -> crate::Result<Self> {
        let adapter = registry.adapter(&format)?;
        let config = extract_config_tolerant(adapter.extract_config(paths.as_slice()).await, &format)?;
        let media_type = adapter.media_type();
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            let name = basename(path.as_path());
            layers.push(Layer::from_file(path, media_type.clone(), name).await?);
        }
        Ok(Self {
            registry,
            config,
            created: Some(Utc::now()),
            config_media_type: MediaType::ConfigV01,
            layers,
            original_layers: None,
        })
    }

    /// Build from a recursive directory walk: one layer per regular
    /// file, annotated with its relative path. Hidden files, symlinks,
    /// and excluded paths are skipped; at least one weight file must
    /// remain. The resulting model uses the layer-per-file config
    /// version.
    ///
    /// Exclusion patterns:
    /// - trailing `/` matches directories by name or path prefix
    /// - patterns containing `/` match an exact relative path or prefix
    /// - patterns with glob characters (`*?[`) match basenames
    /// - anything else matches basenames exactly, files and directories
    pub async fn from_directory(
        dir: impl AsRef<Path>,
        options: DirectoryOptions,
    ) -> crate::Result<Self> {
        Self::from_directory_with(FormatRegistry::default(), dir, options).await
    }

    pub async fn from_directory_with(
        registry: FormatRegistry,
        dir: impl AsRef<Path>,
        options: DirectoryOptions,
    ) -> crate::Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let walk_root = root.clone();
        let files = tokio::task::spawn_blocking(move || walk(walk_root.as_path(), &options.exclusions))
            .await
            .context(error::TaskJoinSnafu)??;

        let weights: Vec<PathBuf> = files
            .iter()
            .filter(|(path, _)| classify::classify(path).is_weight())
            .map(|(path, _)| path.clone())
            .collect();
        if weights.is_empty() {
            return error::NoWeightsFoundSnafu {
                dir: root.display().to_string(),
            }
            .fail();
        }
        let format = format::detect_all(weights.as_slice())?;
        let config = extract_config_tolerant(
            registry
                .adapter(&format)?
                .extract_config(weights.as_slice())
                .await,
            &format,
        )?;

        let mut layers = Vec::with_capacity(files.len());
        for (path, relative) in files {
            let media_type = classify::classify(path.as_path()).media_type();
            layers.push(Layer::from_file(path, media_type, relative).await?);
        }
        Ok(Self {
            registry,
            config,
            created: Some(Utc::now()),
            config_media_type: MediaType::ConfigV02,
            layers,
            original_layers: None,
        })
    }

    /// Wrap an existing model for further mutation, snapshotting its
    /// layer digests for config-only change detection.
    pub fn from_model(model: &BaseModel) -> Self {
        let snapshot = model
            .layers()
            .iter()
            .map(|layer| layer.digest().clone())
            .collect();
        let (config, created) = match model.config_file() {
            ModelConfigFile::Docker(file) => (file.config.clone(), file.descriptor.created),
            // ModelPack configs have no Docker-dialect capability block;
            // rebuild one from the unified view
            ModelConfigFile::Package(_) => {
                let unified = model.model_config();
                (
                    Config {
                        format: Some(unified.format),
                        quantization: Some(unified.quantization),
                        parameters: Some(unified.parameters),
                        architecture: Some(unified.architecture),
                        size: Some(unified.size),
                        ..Default::default()
                    },
                    None,
                )
            }
        };
        Self {
            registry: FormatRegistry::default(),
            config,
            created,
            config_media_type: model.config_media_type().clone(),
            layers: model.layers().to_vec(),
            original_layers: Some(snapshot),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        self.layers.as_slice()
    }

    /// The format adapters this builder consults
    pub fn format_registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// True when every original layer digest is unchanged, element for
    /// element. Always false for builders not created from a model.
    pub fn has_only_config_changes(&self) -> bool {
        let Some(snapshot) = self.original_layers.as_ref() else {
            return false;
        };
        snapshot.len() == self.layers.len()
            && snapshot
                .iter()
                .zip(self.layers.iter())
                .all(|(original, layer)| original == layer.digest())
    }

    pub async fn with_license(mut self, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let name = basename(path);
        self.layers
            .push(Layer::from_file(path, MediaType::License, name).await?);
        Ok(self)
    }

    pub fn with_context_size(mut self, tokens: u64) -> Self {
        self.config.context_size = Some(tokens);
        self
    }

    pub async fn with_multimodal_projector(mut self, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let name = basename(path);
        self.layers
            .push(Layer::from_file(path, MediaType::Mmproj, name).await?);
        Ok(self)
    }

    pub async fn with_chat_template_file(mut self, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let name = basename(path);
        self.layers
            .push(Layer::from_file(path, MediaType::ChatTemplate, name).await?);
        Ok(self)
    }

    /// Pack the given config files into a single tar layer. A model may
    /// carry at most one config archive.
    pub async fn with_config_archive(mut self, paths: &[PathBuf]) -> crate::Result<Self> {
        if self
            .layers
            .iter()
            .any(|layer| layer.media_type() == &MediaType::ConfigArchive)
        {
            return Err(error::Error::ConfigArchiveExists);
        }
        let scratch = Arc::new(tempfile::tempdir().context(error::TempSnafu)?);
        let tar_path = scratch.path().join("config.tar");
        let file = File::create(tar_path.as_path())
            .await
            .context(error::FileSnafu)?;
        let mut archive = ArchiveBuilder::new(file);
        for path in paths {
            archive
                .append_path_with_name(path.as_path(), basename(path.as_path()))
                .await
                .context(error::ArchiveSnafu)?;
        }
        archive.finish().await.context(error::ArchiveSnafu)?;
        let mut layer =
            Layer::from_file(tar_path, MediaType::ConfigArchive, "config.tar").await?;
        layer.retain_scratch(scratch);
        self.layers.push(layer);
        Ok(self)
    }

    /// Tar a whole directory into one layer, preserving its internal
    /// structure. Unlike the config archive, a model may carry any
    /// number of these.
    pub async fn with_dir_tar(mut self, dir: impl AsRef<Path>) -> crate::Result<Self> {
        let dir = dir.as_ref();
        let name = format!("{}.tar", basename(dir));
        let scratch = Arc::new(tempfile::tempdir().context(error::TempSnafu)?);
        let tar_path = scratch.path().join(name.as_str());
        let file = File::create(tar_path.as_path())
            .await
            .context(error::FileSnafu)?;
        let mut archive = ArchiveBuilder::new(file);
        archive
            .append_dir_all(".", dir)
            .await
            .context(error::ArchiveSnafu)?;
        archive.finish().await.context(error::ArchiveSnafu)?;
        let mut layer = Layer::from_file(tar_path, MediaType::DirTar, name).await?;
        layer.retain_scratch(scratch);
        self.layers.push(layer);
        Ok(self)
    }

    /// Attach an already-constructed layer.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Keep a staging directory alive for as long as any current layer is
    pub(crate) fn retain_scratch(mut self, scratch: Arc<tempfile::TempDir>) -> Self {
        for layer in self.layers.iter_mut() {
            layer.retain_scratch(scratch.clone());
        }
        self
    }

    /// Add a single file layer with an explicit relative path, using the
    /// classifier to pick its media type.
    pub async fn with_file_layer(
        mut self,
        path: impl AsRef<Path>,
        relative: impl AsRef<str>,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        let media_type = classify::classify(path).media_type();
        self.layers
            .push(Layer::from_file(path, media_type, relative.as_ref()).await?);
        Ok(self)
    }

    /// Serialize the config and produce the model.
    pub fn build(self) -> crate::Result<BaseModel> {
        let config_file = ConfigFile {
            config: self.config,
            descriptor: ConfigDescriptor {
                created: self.created,
            },
            rootfs: RootFs {
                fs_type: "rootfs".to_string(),
                diff_ids: self
                    .layers
                    .iter()
                    .map(|layer| layer.diff_id().clone())
                    .collect(),
            },
        };
        let raw = serde_json::to_vec(&config_file).context(error::SerializeSnafu)?;
        BaseModel::new(raw, self.config_media_type, self.layers)
    }
}

/// Header problems degrade to an empty config rather than failing the
/// build; everything else propagates.
fn extract_config_tolerant(
    extracted: crate::Result<Config>,
    format: &Format,
) -> crate::Result<Config> {
    match extracted {
        Ok(config) => Ok(config),
        Err(
            err @ (error::Error::HeaderInvalid { .. } | error::Error::HeaderTooLarge { .. }),
        ) => {
            warn!(target: "builder", "skipping weight metadata: {err}");
            Ok(Config {
                format: Some(format.clone()),
                ..Default::default()
            })
        }
        Err(err) => Err(err),
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Collect the regular files of a directory tree with their
/// forward-slash relative paths, skipping hidden entries, symlinks, and
/// exclusions. Excluded directories prune their whole subtree.
fn walk(root: &Path, exclusions: &[String]) -> crate::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.path() == root {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                return false;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walk entry outside root");
            !excluded(relative, entry.file_type().is_dir(), exclusions)
        });
    for entry in walker {
        let entry = entry.map_err(|err| error::Error::Directory {
            source: std::io::Error::other(err),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walk entry outside root");
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.into_path(), relative));
    }
    Ok(files)
}

fn excluded(relative: &Path, is_dir: bool, patterns: &[String]) -> bool {
    let relative_str = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let name = relative
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    for pattern in patterns {
        if let Some(dir_pattern) = pattern.strip_suffix('/') {
            if is_dir
                && (name == dir_pattern
                    || relative_str == dir_pattern
                    || relative_str.starts_with(format!("{dir_pattern}/").as_str()))
            {
                return true;
            }
        } else if pattern.contains('/') {
            if relative_str == *pattern
                || relative_str.starts_with(format!("{pattern}/").as_str())
            {
                return true;
            }
        } else if pattern.contains(['*', '?', '[']) {
            if glob_match(pattern.as_str(), name.as_str()) {
                return true;
            }
        } else if name == *pattern {
            return true;
        }
    }
    false
}

/// Basename glob supporting `*`, `?`, and `[...]` character classes with
/// ranges and `!` negation.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        let Some(&head) = pattern.first() else {
            return text.is_empty();
        };
        match head {
            b'*' => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            b'?' => !text.is_empty() && inner(&pattern[1..], &text[1..]),
            b'[' => {
                let Some(&next) = text.first() else {
                    return false;
                };
                let Some(close) = pattern.iter().position(|&byte| byte == b']') else {
                    // unterminated class matches a literal bracket
                    return next == b'[' && inner(&pattern[1..], &text[1..]);
                };
                let set = &pattern[1..close];
                let (negated, set) = match set.split_first() {
                    Some((b'!', rest)) => (true, rest),
                    _ => (false, set),
                };
                let mut matched = false;
                let mut index = 0;
                while index < set.len() {
                    if index + 2 < set.len() && set[index + 1] == b'-' {
                        if set[index] <= next && next <= set[index + 2] {
                            matched = true;
                        }
                        index += 3;
                    } else {
                        if set[index] == next {
                            matched = true;
                        }
                        index += 1;
                    }
                }
                matched != negated && inner(&pattern[close + 1..], &text[1..])
            }
            byte => !text.is_empty() && text[0] == byte && inner(&pattern[1..], &text[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
