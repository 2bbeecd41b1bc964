use futures::StreamExt;
use snafu::ResultExt;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio_tar::Archive;

use crate::config::ModelConfig;
use crate::error;
use crate::layer::Layer;
use crate::mediatype::MediaType;
use crate::model::BaseModel;
use crate::store::LocalStore;

/// Name of the runtime config written at the bundle root. It lives
/// outside `model/` so it cannot collide with a tokenizer's own
/// config.json.
const RUNTIME_CONFIG: &str = "config.json";
/// Subdirectory holding the model files themselves
const MODEL_DIR: &str = "model";

/// A materialized runtime directory for one model, assembled by
/// hardlinking blobs out of the store.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
    config: ModelConfig,
    gguf_file: Option<PathBuf>,
    safetensors_file: Option<PathBuf>,
    dduf_file: Option<PathBuf>,
    mmproj_path: Option<PathBuf>,
    chat_template_path: Option<PathBuf>,
}

impl Bundle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join(MODEL_DIR)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// First gguf weight file, if the model has one
    pub fn gguf_file(&self) -> Option<&Path> {
        self.gguf_file.as_deref()
    }

    pub fn safetensors_file(&self) -> Option<&Path> {
        self.safetensors_file.as_deref()
    }

    pub fn dduf_file(&self) -> Option<&Path> {
        self.dduf_file.as_deref()
    }

    pub fn mmproj_path(&self) -> Option<&Path> {
        self.mmproj_path.as_deref()
    }

    pub fn chat_template_path(&self) -> Option<&Path> {
        self.chat_template_path.as_deref()
    }
}

impl LocalStore {
    /// Materialize a stored model into `bundles/<alg>/<hex>/`. Any
    /// previous bundle for the model is wholesale replaced. Layer files
    /// land under `model/`; the decoded runtime config is written as
    /// `config.json` at the bundle root.
    pub async fn bundle(&self, reference: &str) -> crate::Result<Bundle> {
        let model = self.model(reference).await?;
        let id = model.id()?;
        let root = self.bundle_dir(&id)?;

        let _guard = self.bundle_lock.lock().await;
        if fs::metadata(root.as_path()).await.is_ok() {
            fs::remove_dir_all(root.as_path())
                .await
                .context(error::DirectorySnafu)?;
        }
        fs::create_dir_all(root.as_path())
            .await
            .context(error::DirectorySnafu)?;

        let config = model.model_config();
        let raw = serde_json::to_vec_pretty(&config).context(error::SerializeSnafu)?;
        fs::write(root.join(RUNTIME_CONFIG), raw.as_slice())
            .await
            .context(error::FileSnafu)?;

        let mut bundle = Bundle {
            root: root.clone(),
            config,
            gguf_file: None,
            safetensors_file: None,
            dduf_file: None,
            mmproj_path: None,
            chat_template_path: None,
        };
        match model.config_media_type() {
            // layer-per-file artifacts carry their paths as annotations
            MediaType::ConfigV02 | MediaType::PackageConfig => {
                unpack_annotated(&model, &mut bundle).await?;
            }
            _ => unpack_legacy(&model, &mut bundle).await?,
        }
        debug!(target: "bundle", "materialized {id} at {}", root.display());
        Ok(bundle)
    }
}

async fn unpack_annotated(model: &BaseModel, bundle: &mut Bundle) -> crate::Result<()> {
    let model_dir = bundle.model_dir();
    for layer in model.layers() {
        let relative = layer.filepath().ok_or_else(|| error::Error::FilepathMissing {
            digest: layer.digest().to_string(),
        })?;
        let dest = validate_path_within(model_dir.as_path(), relative)?;
        materialize(layer, dest.as_path()).await?;
        note_first_seen(bundle, layer.media_type(), dest.as_path());
    }
    Ok(())
}

async fn unpack_legacy(model: &BaseModel, bundle: &mut Bundle) -> crate::Result<()> {
    let model_dir = bundle.model_dir();

    let gguf = model.layers_by_media_type(&MediaType::Gguf);
    let safetensors = model.layers_by_media_type(&MediaType::Safetensors);
    let dduf = model.layers_by_media_type(&MediaType::Dduf);
    if !gguf.is_empty() {
        unpack_weights(&gguf, model_dir.as_path(), "gguf", bundle).await?;
    } else if !safetensors.is_empty() {
        unpack_weights(&safetensors, model_dir.as_path(), "safetensors", bundle).await?;
    } else if !dduf.is_empty() {
        unpack_weights(&dduf, model_dir.as_path(), "dduf", bundle).await?;
    }

    for layer in model.layers() {
        match layer.media_type() {
            MediaType::Mmproj => {
                let dest = model_dir.join("mmproj.gguf");
                materialize(layer, dest.as_path()).await?;
                bundle.mmproj_path = Some(dest);
            }
            MediaType::ChatTemplate => {
                let dest = model_dir.join("chat_template.jinja");
                materialize(layer, dest.as_path()).await?;
                bundle.chat_template_path = Some(dest);
            }
            MediaType::ConfigArchive | MediaType::DirTar => {
                extract_tar(layer, model_dir.as_path()).await?;
            }
            MediaType::ModelFile => {
                let relative =
                    layer
                        .filepath()
                        .ok_or_else(|| error::Error::FilepathMissing {
                            digest: layer.digest().to_string(),
                        })?;
                let dest = validate_path_within(model_dir.as_path(), relative)?;
                materialize(layer, dest.as_path()).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Unpack an ordered weight set with the fixed legacy filenames:
/// `model.<ext>` for a single file, `model-NNNNN-of-NNNNN.<ext>` for a
/// sharded set.
async fn unpack_weights(
    layers: &[&Layer],
    model_dir: &Path,
    extension: &str,
    bundle: &mut Bundle,
) -> crate::Result<()> {
    let total = layers.len();
    for (index, layer) in layers.iter().enumerate() {
        let name = if total == 1 {
            format!("model.{extension}")
        } else {
            format!("model-{:05}-of-{total:05}.{extension}", index + 1)
        };
        let dest = model_dir.join(name);
        materialize(layer, dest.as_path()).await?;
        note_first_seen(bundle, layer.media_type(), dest.as_path());
    }
    Ok(())
}

fn note_first_seen(bundle: &mut Bundle, media_type: &MediaType, dest: &Path) {
    let slot = if MediaType::Gguf.matches(media_type) {
        &mut bundle.gguf_file
    } else if MediaType::Safetensors.matches(media_type) {
        &mut bundle.safetensors_file
    } else if MediaType::Dduf.matches(media_type) {
        &mut bundle.dduf_file
    } else if media_type == &MediaType::Mmproj {
        &mut bundle.mmproj_path
    } else if media_type == &MediaType::ChatTemplate {
        &mut bundle.chat_template_path
    } else {
        return;
    };
    if slot.is_none() {
        *slot = Some(dest.to_path_buf());
    }
}

/// Hardlink a local blob into the bundle, or stream a remote layer when
/// no local file exists.
async fn materialize(layer: &Layer, dest: &Path) -> crate::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
    }
    if layer.is_local() {
        fs::hard_link(layer.path()?, dest)
            .await
            .context(error::HardlinkSnafu)?;
    } else {
        let mut reader = layer.uncompressed().await?;
        let mut file = File::create(dest).await.context(error::FileSnafu)?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .context(error::LayerWriteSnafu)?;
    }
    Ok(())
}

/// Extract a tar layer into the model directory, validating every entry
/// path. Symlinks and hard links inside the archive are skipped;
/// absolute and escaping names abort the unpack.
async fn extract_tar(layer: &Layer, model_dir: &Path) -> crate::Result<()> {
    let reader = layer.uncompressed().await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context(error::ArchiveSnafu)?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context(error::ArchiveSnafu)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!(target: "bundle", "skipping link entry in archive layer");
            continue;
        }
        let name = entry
            .path()
            .context(error::ArchiveSnafu)?
            .to_string_lossy()
            .into_owned();
        // tar directory entries carry a trailing slash
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            continue;
        }
        let dest = validate_path_within(model_dir, trimmed)?;
        if entry_type.is_dir() {
            fs::create_dir_all(dest.as_path())
                .await
                .context(error::DirectorySnafu)?;
            continue;
        }
        if !entry_type.is_file() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
        }
        let mut file = File::create(dest.as_path())
            .await
            .context(error::FileSnafu)?;
        tokio::io::copy(&mut entry, &mut file)
            .await
            .context(error::ArchiveSnafu)?;
    }
    Ok(())
}

/// Join an annotation path onto a base directory, refusing anything
/// that does not stay local: absolute paths, empty or dot paths, null
/// bytes, and any traversal that climbs out of the base.
pub(crate) fn validate_path_within(base: &Path, relative: &str) -> crate::Result<PathBuf> {
    let traversal = || error::Error::PathTraversal {
        path: relative.to_string(),
    };
    if relative.is_empty() || relative == "." || relative.contains('\0') {
        return Err(traversal());
    }
    let relative_path = Path::new(relative);
    if relative_path.is_absolute() {
        return Err(traversal());
    }
    let mut cleaned = PathBuf::new();
    let mut depth: usize = 0;
    for component in relative_path.components() {
        match component {
            Component::Normal(part) => {
                cleaned.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(traversal());
                }
                cleaned.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    if depth == 0 {
        return Err(traversal());
    }
    Ok(base.join(cleaned))
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::path::Path;

    use tokio_util::sync::CancellationToken;

    use crate::builder::{Builder, DirectoryOptions};
    use crate::digest::Digest;
    use crate::format::{gguf, safetensors};
    use crate::layer::Layer;
    use crate::manifest::ANNOTATION_FILEPATH;
    use crate::mediatype::MediaType;
    use crate::model::BaseModel;
    use crate::store::LocalStore;

    use super::validate_path_within;

    async fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    async fn file_sha256(path: &Path) -> Digest {
        Digest::sha256_bytes(tokio::fs::read(path).await.unwrap().as_slice())
    }

    #[test]
    fn test_path_guard_accepts_local_paths() {
        let base = Path::new("/bundle/model");
        assert_eq!(
            validate_path_within(base, "model.gguf").unwrap(),
            base.join("model.gguf")
        );
        assert_eq!(
            validate_path_within(base, "text_encoder/config.json").unwrap(),
            base.join("text_encoder/config.json")
        );
        // traversal that stays local is cleaned
        assert_eq!(
            validate_path_within(base, "a/../b.txt").unwrap(),
            base.join("b.txt")
        );
    }

    #[test]
    fn test_path_guard_rejects_adversarial_inputs() {
        let base = Path::new("/bundle/model");
        for input in [
            "..",
            "../../../etc/passwd",
            "/etc/passwd",
            "",
            ".",
            "foo/../../etc",
            "a/..",
            "bad\0name",
        ] {
            let err = validate_path_within(base, input).unwrap_err();
            assert!(
                matches!(err, crate::error::Error::PathTraversal { .. }),
                "input: {input:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_single_gguf_pack_unpack() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("smollm.gguf");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[64]], |_| 0))
            .await
            .unwrap();

        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        let layer_digest = model.layers()[0].digest().clone();
        store
            .write(&model, Some("smollm"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("smollm").await.unwrap();
        // legacy mode renames the single weight to model.gguf
        let unpacked = bundle.model_dir().join("model.gguf");
        assert_eq!(file_sha256(unpacked.as_path()).await, layer_digest);
        assert_eq!(bundle.gguf_file().unwrap(), unpacked.as_path());
        // runtime config sits at the bundle root, not in model/
        let config_raw = tokio::fs::read(bundle.root().join("config.json")).await.unwrap();
        let config: serde_json::Value = serde_json::from_slice(config_raw.as_slice()).unwrap();
        assert_eq!(config["format"], "gguf");
    }

    #[tokio::test]
    async fn test_sharded_safetensors_unpack() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let header = serde_json::json!({
            "w": {"dtype": "F16", "shape": [4], "data_offsets": [0, 8]},
        });
        for index in 1..=3 {
            let name = format!("w-{index:05}-of-00003.safetensors");
            tokio::fs::write(
                dir.path().join(name),
                safetensors::test::fixture(&header, &[index as u8; 8]),
            )
            .await
            .unwrap();
        }
        let first = dir.path().join("w-00001-of-00003.safetensors");
        let model = Builder::from_path(first.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        store
            .write(&model, Some("sharded"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("sharded").await.unwrap();
        for index in 1..=3 {
            let name = format!("model-{index:05}-of-00003.safetensors");
            assert!(
                tokio::fs::metadata(bundle.model_dir().join(name.as_str()))
                    .await
                    .is_ok(),
                "missing {name}"
            );
        }
        assert!(bundle
            .safetensors_file()
            .unwrap()
            .ends_with("model-00001-of-00003.safetensors"));
    }

    #[tokio::test]
    async fn test_directory_round_trip_preserves_nesting() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("text_encoder")).await.unwrap();
        let header = serde_json::json!({
            "w": {"dtype": "F32", "shape": [2], "data_offsets": [0, 8]},
        });
        let fixtures: Vec<(&str, Vec<u8>)> = vec![
            ("model.safetensors", safetensors::test::fixture(&header, &[1u8; 8])),
            ("config.json", b"{\"n_ctx\": 2048}".to_vec()),
            (
                "text_encoder/model.safetensors",
                safetensors::test::fixture(&header, &[2u8; 8]),
            ),
            ("text_encoder/config.json", b"{}".to_vec()),
        ];
        for (name, bytes) in fixtures.iter() {
            tokio::fs::write(root.join(name), bytes.as_slice()).await.unwrap();
        }

        let model = Builder::from_directory(root, DirectoryOptions::default())
            .await
            .unwrap()
            .build()
            .unwrap();
        store
            .write(&model, Some("nested"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("nested").await.unwrap();
        for (name, bytes) in fixtures.iter() {
            let unpacked = tokio::fs::read(bundle.model_dir().join(name)).await.unwrap();
            assert_eq!(&unpacked, bytes, "file {name} differs");
        }
        // v0.2 keeps original names
        assert!(bundle
            .safetensors_file()
            .unwrap()
            .ends_with("model.safetensors"));
    }

    #[tokio::test]
    async fn test_traversal_annotation_aborts_unpack() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[2]], |_| 0))
            .await
            .unwrap();

        // craft a layer whose filepath annotation escapes the bundle
        let mut layer = Layer::from_file(weight.as_path(), MediaType::Gguf, "model.gguf")
            .await
            .unwrap();
        let mut descriptor = layer.descriptor().clone();
        let annotations: &mut HashMap<String, String> =
            descriptor.annotations.as_mut().unwrap();
        annotations.insert(
            ANNOTATION_FILEPATH.to_string(),
            "../../../etc/passwd".to_string(),
        );
        layer = Layer::from_blob(descriptor, weight.as_path());

        let config = r#"{
            "config": {"format": "gguf"},
            "rootfs": {"type": "rootfs", "diff_ids": []}
        }"#;
        let model = BaseModel::new(
            config.as_bytes().to_vec(),
            MediaType::ConfigV02,
            vec![layer],
        )
        .unwrap();
        let id = store
            .write(&model, Some("evil"), None, &CancellationToken::new())
            .await
            .unwrap();

        let err = store.bundle("evil").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::PathTraversal { .. }));

        // the bundle holds at most the runtime config
        let root = store.bundle_dir(&id).unwrap();
        let mut entries = tokio::fs::read_dir(root.as_path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert!(
            names.is_empty() || names == vec!["config.json".to_string()],
            "unexpected bundle contents: {names:?}"
        );
    }

    #[tokio::test]
    async fn test_config_archive_extracted_into_model_dir() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        let tokenizer = dir.path().join("tokenizer.json");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[2]], |_| 0))
            .await
            .unwrap();
        tokio::fs::write(tokenizer.as_path(), b"{\"vocab\": []}")
            .await
            .unwrap();

        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .with_config_archive(&[tokenizer.clone()])
            .await
            .unwrap()
            .build()
            .unwrap();
        store
            .write(&model, Some("with-config"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("with-config").await.unwrap();
        let extracted = tokio::fs::read(bundle.model_dir().join("tokenizer.json"))
            .await
            .unwrap();
        assert_eq!(extracted, b"{\"vocab\": []}");
    }

    #[tokio::test]
    async fn test_bundle_is_wholesale_replaced() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[2]], |_| 0))
            .await
            .unwrap();
        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        store
            .write(&model, Some("replace"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("replace").await.unwrap();
        // plant a stale file; the next materialization must remove it
        tokio::fs::write(bundle.root().join("stale"), b"x").await.unwrap();
        let bundle = store.bundle("replace").await.unwrap();
        assert!(tokio::fs::metadata(bundle.root().join("stale")).await.is_err());
        assert!(tokio::fs::metadata(bundle.model_dir().join("model.gguf"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_mmproj_and_chat_template_unpack() {
        let (_guard, store) = store().await;
        let dir = tempfile::tempdir().unwrap();
        let weight = dir.path().join("model.gguf");
        let mmproj = dir.path().join("mmproj-f16.gguf");
        let template = dir.path().join("template.jinja");
        tokio::fs::write(weight.as_path(), gguf::test::fixture(&[&[2]], |_| 0))
            .await
            .unwrap();
        tokio::fs::write(mmproj.as_path(), gguf::test::fixture(&[&[3]], |_| 0))
            .await
            .unwrap();
        tokio::fs::write(template.as_path(), b"{{ messages }}").await.unwrap();

        let model = Builder::from_path(weight.as_path())
            .await
            .unwrap()
            .with_multimodal_projector(mmproj.as_path())
            .await
            .unwrap()
            .with_chat_template_file(template.as_path())
            .await
            .unwrap()
            .build()
            .unwrap();
        store
            .write(&model, Some("mm"), None, &CancellationToken::new())
            .await
            .unwrap();

        let bundle = store.bundle("mm").await.unwrap();
        assert!(bundle.mmproj_path().unwrap().ends_with("mmproj.gguf"));
        assert!(bundle
            .chat_template_path()
            .unwrap()
            .ends_with("chat_template.jinja"));
        // the mmproj does not displace the primary weight
        assert!(bundle.gguf_file().unwrap().ends_with("model.gguf"));
    }
}
