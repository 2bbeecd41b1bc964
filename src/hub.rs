use async_recursion::async_recursion;
use futures::future::join_all;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::builder::Builder;
use crate::bundle::validate_path_within;
use crate::classify::{self, FileKind};
use crate::error;
use crate::format::Shard;
use crate::layer::Layer;
use crate::mediatype::MediaType;
use crate::model::BaseModel;
use crate::progress::{null_handle, TrackedReader, Tracker};
use crate::transport::status_error;

/// Bound on in-flight file downloads
const MAX_CONCURRENT_DOWNLOADS: usize = 4;
/// Quantization selected when the tag names none
const DEFAULT_QUANTIZATION: &str = "Q4_K_M";
/// Tags that mean "give me the default quantization"
const DEFAULT_TAGS: &[&str] = &["", "latest", "main"];
/// Separators that bound a quantization token inside a filename
const TOKEN_SEPARATORS: &[u8] = b"-._";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// One file in a hosted repository tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    entry_type: String,
    path: String,
    #[serde(default)]
    size: u64,
}

/// The weight files chosen for one pull, plus an optional multimodal
/// projector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    pub weights: Vec<String>,
    pub mmproj: Option<String>,
}

/// Client for a model-hosting repository with a recursive tree API and
/// direct file resolution, in the huggingface.co shape.
#[derive(Clone)]
pub struct HubClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HubClient {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match self.token.as_ref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List every file in the repository at a revision. Each response
    /// may mix files and subdirectories; subdirectories are listed
    /// recursively.
    pub async fn list_files(&self, repo: &str, revision: &str) -> crate::Result<Vec<RepoFile>> {
        self.list_tree(repo, revision, "").await
    }

    #[async_recursion]
    async fn list_tree(
        &self,
        repo: &str,
        revision: &str,
        path: &str,
    ) -> crate::Result<Vec<RepoFile>> {
        let suffix = if path.is_empty() {
            format!("api/models/{repo}/tree/{revision}")
        } else {
            format!("api/models/{repo}/tree/{revision}/{path}")
        };
        let url = self.base.join(suffix.as_str()).context(error::UrlSnafu)?;
        trace!(target: "hub", "listing {url}");
        let response = self
            .request(url)
            .send()
            .await
            .context(error::RequestSnafu)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), suffix.as_str()));
        }
        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .context(error::ResponseDeserializeSnafu)?;
        let mut files = Vec::new();
        for entry in entries {
            if entry.entry_type == "directory" {
                files.extend(self.list_tree(repo, revision, entry.path.as_str()).await?);
            } else {
                files.push(RepoFile {
                    path: entry.path,
                    size: entry.size,
                });
            }
        }
        Ok(files)
    }

    async fn download_file(
        &self,
        repo: &str,
        revision: &str,
        file: &RepoFile,
        dest: &Path,
        handle: crate::progress::LayerHandle,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let suffix = format!("{repo}/resolve/{revision}/{}", file.path);
        let url = self.base.join(suffix.as_str()).context(error::UrlSnafu)?;
        let response = self
            .request(url)
            .send()
            .await
            .context(error::RequestSnafu)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), file.path.as_str()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.context(error::DirectorySnafu)?;
        }
        let reader = StreamReader::new(
            futures::TryStreamExt::map_err(response.bytes_stream(), std::io::Error::other),
        );
        let mut reader = TrackedReader::new(reader, handle.clone());
        let mut out = File::create(dest).await.context(error::FileSnafu)?;
        let mut buffer = vec![0u8; COPY_BUF_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(error::Error::Interrupted);
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(error::Error::Interrupted),
                read = reader.read(&mut buffer) => read.context(error::LayerReadSnafu)?,
            };
            if n == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(&mut out, &buffer[..n])
                .await
                .context(error::LayerWriteSnafu)?;
        }
        tokio::io::AsyncWriteExt::flush(&mut out)
            .await
            .context(error::LayerWriteSnafu)?;
        handle.finish().await;
        Ok(())
    }

    /// Pull a repository and assemble it into a model artifact: list the
    /// tree, keep weights and configs, pick a GGUF quantization by tag,
    /// download with bounded parallelism, then build. Partial files stay
    /// in the staging directory when the set fails.
    pub async fn ingest(
        &self,
        repo: &str,
        tag: &str,
        revision: Option<&str>,
        tracker: Option<&Tracker>,
        cancel: &CancellationToken,
    ) -> crate::Result<BaseModel> {
        let revision = revision.unwrap_or("main");
        let files = self.list_files(repo, revision).await?;
        let relevant = filter_repo_files(files.as_slice());
        let names: Vec<String> = relevant.iter().map(|file| file.path.clone()).collect();
        let selection = select_weight_files(names.as_slice(), tag);
        if selection.weights.is_empty() {
            return error::NoWeightsFoundSnafu {
                dir: repo.to_string(),
            }
            .fail();
        }

        // weights plus every config-flavored file ride along
        let mut wanted: Vec<RepoFile> = Vec::new();
        for file in relevant.iter() {
            let is_selected_weight = selection.weights.contains(&file.path)
                || selection.mmproj.as_deref() == Some(file.path.as_str());
            let is_weight = classify::classify(Path::new(file.path.as_str())).is_weight();
            if is_selected_weight || !is_weight {
                wanted.push(file.clone());
            }
        }

        let staging = Arc::new(tempfile::tempdir().context(error::TempSnafu)?);
        let downloaded = self
            .download_set(repo, revision, wanted.as_slice(), staging.path(), tracker, cancel)
            .await?;

        let local = |name: &str| -> Option<PathBuf> {
            downloaded
                .iter()
                .find(|(path, _)| path == name)
                .map(|(_, dest)| dest.clone())
        };

        let weight_paths: Vec<PathBuf> = selection
            .weights
            .iter()
            .filter_map(|name| local(name))
            .collect();
        let mut builder = Builder::from_paths(&weight_paths).await?;
        if let Some(mmproj) = selection.mmproj.as_deref().and_then(local) {
            builder = builder.with_multimodal_projector(mmproj.as_path()).await?;
        }

        let mut config_paths: Vec<PathBuf> = Vec::new();
        let mut context_size = None;
        for (name, path) in downloaded.iter() {
            match classify::classify(Path::new(name)) {
                FileKind::ChatTemplate => {
                    // best effort: a bad template downgrades to a warning
                    match Layer::from_file(
                        path.as_path(),
                        MediaType::ChatTemplate,
                        basename(path.as_path()),
                    )
                    .await
                    {
                        Ok(layer) => builder = builder.with_layer(layer),
                        Err(err) => {
                            warn!(target: "hub", "skipping chat template '{name}': {err}");
                            if let Some(tracker) = tracker {
                                tracker
                                    .warning(format!("skipping chat template '{name}': {err}"))
                                    .await?;
                            }
                        }
                    }
                }
                FileKind::Config => {
                    if basename(path.as_path()) == "config.json" {
                        if let Ok(raw) = fs::read(path.as_path()).await {
                            context_size = extract_context_size(raw.as_slice());
                        }
                    }
                    config_paths.push(path.clone());
                }
                _ => {}
            }
        }
        if !config_paths.is_empty() {
            builder = builder.with_config_archive(config_paths.as_slice()).await?;
        }
        if let Some(tokens) = context_size {
            builder = builder.with_context_size(tokens);
        }
        builder.retain_scratch(staging).build()
    }

    /// Download a file set with at most four in flight. Per-file progress
    /// uses a fingerprint ID derived from the filename, since content
    /// digests are unknown until the bytes arrive. Any failure aborts the
    /// set with an aggregated error; partial files are left in place.
    async fn download_set(
        &self,
        repo: &str,
        revision: &str,
        files: &[RepoFile],
        staging: &Path,
        tracker: Option<&Tracker>,
        cancel: &CancellationToken,
    ) -> crate::Result<Vec<(String, PathBuf)>> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS));
        let mut tasks: Vec<JoinHandle<(String, crate::Result<PathBuf>)>> = Vec::new();
        for file in files.iter().cloned() {
            let client = self.clone();
            let repo = repo.to_string();
            let revision = revision.to_string();
            let dest = match validate_path_within(staging, file.path.as_str()) {
                Ok(dest) => dest,
                Err(err) => return Err(err),
            };
            let handle = tracker
                .map(|tracker| tracker.register(fingerprint(file.path.as_str()), file.size))
                .unwrap_or_else(null_handle);
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                debug!(target: "hub", "downloading {}", file.path);
                let result = client
                    .download_file(
                        repo.as_str(),
                        revision.as_str(),
                        &file,
                        dest.as_path(),
                        handle,
                        cancel,
                    )
                    .await;
                (file.path, result.map(|_| dest))
            }));
        }

        let mut downloaded = Vec::new();
        let mut failures = Vec::new();
        let total = tasks.len();
        for joined in join_all(tasks).await {
            let (path, result) = joined.context(error::TaskJoinSnafu)?;
            match result {
                Ok(dest) => downloaded.push((path, dest)),
                Err(err) => failures.push(format!("{path}: {err}")),
            }
        }
        if !failures.is_empty() {
            return error::DownloadSetSnafu {
                failed: failures.len(),
                total,
                reasons: failures.join("\n"),
            }
            .fail();
        }
        Ok(downloaded)
    }
}

/// Keep only the files that belong in a model artifact: weight files
/// plus config-flavored files (json, md, txt, vocab, jinja,
/// tokenizer.model).
pub fn filter_repo_files(files: &[RepoFile]) -> Vec<RepoFile> {
    files
        .iter()
        .filter(|file| {
            matches!(
                classify::classify(Path::new(file.path.as_str())),
                FileKind::WeightGguf
                    | FileKind::WeightSafetensors
                    | FileKind::WeightDduf
                    | FileKind::Config
                    | FileKind::ChatTemplate
            )
        })
        .cloned()
        .collect()
}

/// Choose the weight files for a pull. GGUF repositories holding several
/// quantization variants select by tag; other formats take every weight
/// file. The mmproj candidate prefers an f16 variant.
pub fn select_weight_files(files: &[String], tag: &str) -> Selection {
    let mut sorted: Vec<&String> = files.iter().collect();
    sorted.sort();

    let gguf: Vec<&str> = sorted
        .iter()
        .filter(|name| {
            name.to_ascii_lowercase().ends_with(".gguf")
                && !name.to_ascii_lowercase().contains("mmproj")
        })
        .map(|name| name.as_str())
        .collect();

    if gguf.is_empty() {
        let weights: Vec<String> = sorted
            .iter()
            .filter(|name| classify::classify(Path::new(name.as_str())).is_weight())
            .map(|name| name.to_string())
            .collect();
        return Selection {
            weights,
            mmproj: None,
        };
    }

    let mmproj = select_mmproj(sorted.as_slice());
    let quantization = if DEFAULT_TAGS.contains(&tag.to_ascii_lowercase().as_str()) {
        DEFAULT_QUANTIZATION.to_string()
    } else {
        tag.to_string()
    };

    let mut matched = matching_set(gguf.as_slice(), quantization.as_str());
    if matched.is_empty() && !quantization.eq_ignore_ascii_case(DEFAULT_QUANTIZATION) {
        matched = matching_set(gguf.as_slice(), DEFAULT_QUANTIZATION);
    }
    if matched.is_empty() {
        // last resort: the lexicographically-first file and its shards
        if let Some(first) = gguf.first() {
            matched = expand_shards(first, gguf.as_slice());
        }
    }
    Selection {
        weights: matched,
        mmproj,
    }
}

fn select_mmproj(files: &[&String]) -> Option<String> {
    let candidates: Vec<&str> = files
        .iter()
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".gguf") && lower.contains("mmproj")
        })
        .map(|name| name.as_str())
        .collect();
    candidates
        .iter()
        .find(|name| name.to_ascii_lowercase().contains("f16"))
        .or_else(|| candidates.first())
        .map(|name| name.to_string())
}

/// The first file (in sorted order) matching the quantization token,
/// expanded to its full shard set.
fn matching_set(gguf: &[&str], quantization: &str) -> Vec<String> {
    gguf.iter()
        .find(|name| contains_token(name, quantization))
        .map(|name| expand_shards(name, gguf))
        .unwrap_or_default()
}

/// Whether `name` contains `token` bounded by a separator on the left
/// and a separator or end-of-name on the right, case-insensitively.
/// Shard suffixes keep matching because `-` is a separator.
fn contains_token(name: &str, token: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let token = token.to_ascii_lowercase();
    if token.is_empty() {
        return false;
    }
    let bytes = name.as_bytes();
    let mut start = 0;
    while let Some(found) = name[start..].find(token.as_str()) {
        let begin = start + found;
        let end = begin + token.len();
        let left_ok = begin > 0 && TOKEN_SEPARATORS.contains(&bytes[begin - 1]);
        let right_ok = end == bytes.len() || TOKEN_SEPARATORS.contains(&bytes[end]);
        if left_ok && right_ok {
            return true;
        }
        start = begin + 1;
    }
    false
}

/// Expand one filename to its full shard set as present in the listing.
fn expand_shards(name: &str, all: &[&str]) -> Vec<String> {
    let basename = name.rsplit_once('/').map(|(_, tail)| tail).unwrap_or(name);
    let Some(shard) = Shard::parse(basename) else {
        return vec![name.to_string()];
    };
    let prefix = name.strip_suffix(basename).unwrap_or("");
    let mut set: Vec<String> = (1..=shard.total)
        .map(|index| format!("{prefix}{}", shard.name_of(index)))
        .filter(|candidate| all.contains(&candidate.as_str()))
        .collect();
    if set.is_empty() {
        set.push(name.to_string());
    }
    set
}

/// Best-effort context size from a config.json: the first of the known
/// keys holding a positive number.
fn extract_context_size(raw: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    for key in ["max_position_embeddings", "n_positions", "max_length", "n_ctx"] {
        if let Some(n) = value.get(key).and_then(serde_json::Value::as_i64) {
            if n > 0 {
                return Some(n as u64);
            }
        }
    }
    None
}

/// Progress fingerprint for a file whose content digest is not yet
/// known: the sha256 of its name.
fn fingerprint(name: &str) -> String {
    let hash = Sha256::digest(name.as_bytes());
    format!("sha256:{}", base16::encode_lower(hash.as_slice()))
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::{
        contains_token, extract_context_size, filter_repo_files, select_weight_files, RepoFile,
        Selection, TreeEntry,
    };

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_tree_entry_shapes() {
        let file: TreeEntry =
            serde_json::from_str(r#"{"type":"file","path":"model.gguf","size":42}"#).unwrap();
        assert_eq!(file.entry_type, "file");
        assert_eq!(file.size, 42);
        let dir: TreeEntry =
            serde_json::from_str(r#"{"type":"directory","path":"text_encoder"}"#).unwrap();
        assert_eq!(dir.entry_type, "directory");
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_filter_keeps_weights_and_configs() {
        let files = vec![
            RepoFile { path: "model.gguf".into(), size: 1 },
            RepoFile { path: "config.json".into(), size: 1 },
            RepoFile { path: "tokenizer.model".into(), size: 1 },
            RepoFile { path: "template.jinja".into(), size: 1 },
            RepoFile { path: "weights.bin".into(), size: 1 },
            RepoFile { path: "run.py".into(), size: 1 },
        ];
        let kept: Vec<String> = filter_repo_files(files.as_slice())
            .into_iter()
            .map(|file| file.path)
            .collect();
        assert_eq!(
            kept,
            vec!["model.gguf", "config.json", "tokenizer.model", "template.jinja"]
        );
    }

    #[test]
    fn test_token_boundaries() {
        assert!(contains_token("m-Q4_K_M.gguf", "Q4_K_M"));
        assert!(contains_token("m.Q4_K_M.gguf", "q4_k_m"));
        assert!(contains_token("m_Q4_K_M-00001-of-00002.gguf", "Q4_K_M"));
        // no separator on the left
        assert!(!contains_token("mQ4_K_M.gguf", "Q4_K_M"));
        // token at the very start has no left separator
        assert!(!contains_token("Q4_K_M.gguf", "Q4_K_M"));
        // embedded without right separator
        assert!(!contains_token("m-Q4_K_MX.gguf", "Q4_K_M"));
    }

    #[test]
    fn test_quantization_selection_with_shards() {
        let files = names(&[
            "m-Q4_K_M.gguf",
            "m-Q8_0.gguf",
            "m-Q4_K_M-00001-of-00002.gguf",
            "m-Q4_K_M-00002-of-00002.gguf",
            "mmproj-f16.gguf",
            "mmproj-f32.gguf",
        ]);
        let selection = select_weight_files(files.as_slice(), "Q4_K_M");
        assert_eq!(
            selection.weights,
            names(&[
                "m-Q4_K_M-00001-of-00002.gguf",
                "m-Q4_K_M-00002-of-00002.gguf",
            ])
        );
        assert_eq!(selection.mmproj.as_deref(), Some("mmproj-f16.gguf"));
    }

    #[test]
    fn test_default_tags_select_default_quantization() {
        let files = names(&["m-Q8_0.gguf", "m-Q4_K_M.gguf"]);
        for tag in ["", "latest", "main"] {
            let selection = select_weight_files(files.as_slice(), tag);
            assert_eq!(selection.weights, names(&["m-Q4_K_M.gguf"]), "tag: {tag}");
        }
    }

    #[test]
    fn test_fallback_to_first_file() {
        // no Q4_K_M present: "latest" falls back to the lexicographic first
        let files = names(&["m-Q5_K_S.gguf", "m-Q8_0.gguf"]);
        let selection = select_weight_files(files.as_slice(), "latest");
        assert_eq!(selection.weights, names(&["m-Q5_K_S.gguf"]));

        // unmatched explicit tag, no default available either
        let selection = select_weight_files(files.as_slice(), "Q2_K");
        assert_eq!(selection.weights, names(&["m-Q5_K_S.gguf"]));
    }

    #[test]
    fn test_unmatched_tag_falls_back_to_default() {
        let files = names(&["m-Q2_K.gguf", "m-Q4_K_M.gguf", "m-Q8_0.gguf"]);
        let selection = select_weight_files(files.as_slice(), "Q6_K");
        assert_eq!(selection.weights, names(&["m-Q4_K_M.gguf"]));
    }

    #[test]
    fn test_fallback_first_expands_shards() {
        let files = names(&[
            "m-Q5_K_S-00001-of-00002.gguf",
            "m-Q5_K_S-00002-of-00002.gguf",
        ]);
        let selection = select_weight_files(files.as_slice(), "latest");
        assert_eq!(selection.weights, files);
    }

    #[test]
    fn test_safetensors_repo_takes_all_weights() {
        let files = names(&[
            "model-00001-of-00002.safetensors",
            "model-00002-of-00002.safetensors",
            "config.json",
        ]);
        let selection = select_weight_files(files.as_slice(), "latest");
        assert_eq!(
            selection,
            Selection {
                weights: names(&[
                    "model-00001-of-00002.safetensors",
                    "model-00002-of-00002.safetensors",
                ]),
                mmproj: None,
            }
        );
    }

    #[test]
    fn test_context_size_extraction() {
        assert_eq!(
            extract_context_size(br#"{"max_position_embeddings": 4096}"#),
            Some(4096)
        );
        // first listed key wins
        assert_eq!(
            extract_context_size(br#"{"n_ctx": 512, "max_position_embeddings": 4096}"#),
            Some(4096)
        );
        // non-positive values are rejected, later keys still apply
        assert_eq!(
            extract_context_size(br#"{"max_position_embeddings": 0, "n_ctx": 2048}"#),
            Some(2048)
        );
        assert_eq!(extract_context_size(br#"{"unrelated": 1}"#), None);
        assert_eq!(extract_context_size(b"not json"), None);
    }
}
