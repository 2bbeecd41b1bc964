use async_trait::async_trait;
use snafu::ResultExt;
use std::path::{Path, PathBuf};

use crate::config::{Config, DiffusersInfo};
use crate::error;
use crate::format::{self, Format, FormatAdapter};
use crate::mediatype::MediaType;

/// DDUF bundles a whole Diffusers pipeline into a single archive, so the
/// adapter has no shard or header logic; the config records the layout
/// and archive name for the runtime.
pub struct DdufAdapter;

#[async_trait]
impl FormatAdapter for DdufAdapter {
    fn format(&self) -> Format {
        Format::Diffusers
    }

    fn media_type(&self) -> MediaType {
        MediaType::Dduf
    }

    fn discover_shards(&self, path: &Path) -> crate::Result<Vec<PathBuf>> {
        Ok(vec![path.to_path_buf()])
    }

    async fn extract_config(&self, paths: &[PathBuf]) -> crate::Result<Config> {
        let path = paths.first().ok_or(error::Error::EmptyPathList)?;
        let size = tokio::fs::metadata(path)
            .await
            .context(error::FileSnafu)?
            .len();
        let dduf_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Config {
            format: Some(Format::Diffusers),
            architecture: Some("diffusers".to_string()),
            size: Some(format::format_size(size)),
            diffusers: Some(DiffusersInfo {
                layout: "dduf".to_string(),
                dduf_file,
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod test {
    use crate::format::{Format, FormatAdapter};

    use super::DdufAdapter;

    #[tokio::test]
    async fn test_extract_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flux.dduf");
        tokio::fs::write(path.as_path(), vec![0u8; 2048])
            .await
            .unwrap();
        let config = DdufAdapter.extract_config(&[path]).await.unwrap();
        assert_eq!(config.format, Some(Format::Diffusers));
        assert_eq!(config.architecture.as_deref(), Some("diffusers"));
        let diffusers = config.diffusers.unwrap();
        assert_eq!(diffusers.layout, "dduf");
        assert_eq!(diffusers.dduf_file, "flux.dduf");
        assert_eq!(config.size.as_deref(), Some("2.0kB"));
    }
}
