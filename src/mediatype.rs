use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Handles the media types recognized by this crate across both the
/// Docker-style and CNCF ModelPack dialects. Types outside the two
/// registries are preserved as-is in the Other variant so manifests
/// produced by newer tooling still round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// OCI image manifest wrapper
    Manifest,
    /// Docker-style model config, weights addressed by media type
    ConfigV01,
    /// Docker-style model config, one layer per file with path annotations
    ConfigV02,
    /// CNCF ModelPack config
    PackageConfig,
    Gguf,
    Safetensors,
    Dduf,
    PackageGguf,
    PackageSafetensors,
    ChatTemplate,
    Mmproj,
    License,
    ConfigArchive,
    DirTar,
    ModelFile,
    Other(String),
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Manifest => "application/vnd.oci.image.manifest.v1+json",
            Self::ConfigV01 => "application/vnd.docker.ai.model.config.v0.1+json",
            Self::ConfigV02 => "application/vnd.docker.ai.model.config.v0.2+json",
            Self::PackageConfig => "application/vnd.cncf.model.config.v1+json",
            Self::Gguf => "application/vnd.docker.ai.gguf.v3",
            Self::Safetensors => "application/vnd.docker.ai.safetensors",
            Self::Dduf => "application/vnd.docker.ai.dduf",
            Self::PackageGguf => "application/vnd.cncf.model.weight.v1.gguf",
            Self::PackageSafetensors => "application/vnd.cncf.model.weight.v1.safetensors",
            Self::ChatTemplate => "application/vnd.docker.ai.chat.template.jinja",
            Self::Mmproj => "application/vnd.docker.ai.mmproj",
            Self::License => "application/vnd.docker.ai.license",
            Self::ConfigArchive => "application/vnd.docker.ai.vllm.config.tar",
            Self::DirTar => "application/vnd.docker.ai.dir.tar",
            Self::ModelFile => "application/vnd.docker.ai.model.file",
            Self::Other(value) => value.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "application/vnd.oci.image.manifest.v1+json" => Self::Manifest,
            "application/vnd.docker.ai.model.config.v0.1+json" => Self::ConfigV01,
            "application/vnd.docker.ai.model.config.v0.2+json" => Self::ConfigV02,
            "application/vnd.cncf.model.config.v1+json" => Self::PackageConfig,
            "application/vnd.docker.ai.gguf.v3" => Self::Gguf,
            "application/vnd.docker.ai.safetensors" => Self::Safetensors,
            "application/vnd.docker.ai.dduf" => Self::Dduf,
            "application/vnd.cncf.model.weight.v1.gguf" => Self::PackageGguf,
            "application/vnd.cncf.model.weight.v1.safetensors" => Self::PackageSafetensors,
            "application/vnd.docker.ai.chat.template.jinja" => Self::ChatTemplate,
            "application/vnd.docker.ai.mmproj" => Self::Mmproj,
            "application/vnd.docker.ai.license" => Self::License,
            "application/vnd.docker.ai.vllm.config.tar" => Self::ConfigArchive,
            "application/vnd.docker.ai.dir.tar" => Self::DirTar,
            "application/vnd.docker.ai.model.file" => Self::ModelFile,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this type carries model weights in either dialect
    pub fn is_weight(&self) -> bool {
        matches!(
            self,
            Self::Gguf
                | Self::Safetensors
                | Self::Dduf
                | Self::PackageGguf
                | Self::PackageSafetensors
        )
    }

    /// Whether this type is a model config blob in either dialect
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigV01 | Self::ConfigV02 | Self::PackageConfig)
    }

    /// Media-type equality across dialects. GGUF and safetensors weights
    /// match their ModelPack equivalents in both directions; every other
    /// type requires exact equality.
    pub fn matches(&self, other: &MediaType) -> bool {
        if self == other {
            return true;
        }
        matches!(
            (self, other),
            (Self::Gguf, Self::PackageGguf)
                | (Self::PackageGguf, Self::Gguf)
                | (Self::Safetensors, Self::PackageSafetensors)
                | (Self::PackageSafetensors, Self::Safetensors)
        )
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Ok(MediaType::parse(string.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::MediaType;

    #[test]
    fn test_round_trip() {
        let types = [
            MediaType::Manifest,
            MediaType::ConfigV01,
            MediaType::ConfigV02,
            MediaType::PackageConfig,
            MediaType::Gguf,
            MediaType::Safetensors,
            MediaType::Dduf,
            MediaType::PackageGguf,
            MediaType::PackageSafetensors,
            MediaType::ChatTemplate,
            MediaType::Mmproj,
            MediaType::License,
            MediaType::ConfigArchive,
            MediaType::DirTar,
            MediaType::ModelFile,
        ];
        for media_type in types {
            assert_eq!(MediaType::parse(media_type.as_str()), media_type);
        }
        let custom = MediaType::parse("application/vnd.example.custom");
        assert_eq!(
            custom,
            MediaType::Other("application/vnd.example.custom".to_string())
        );
        assert_eq!(custom.as_str(), "application/vnd.example.custom");
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&MediaType::Gguf).unwrap();
        assert_eq!(json, "\"application/vnd.docker.ai.gguf.v3\"");
        let parsed: MediaType = serde_json::from_str(json.as_str()).unwrap();
        assert_eq!(parsed, MediaType::Gguf);
    }

    #[test]
    fn test_cross_dialect_matching() {
        assert!(MediaType::Gguf.matches(&MediaType::PackageGguf));
        assert!(MediaType::PackageGguf.matches(&MediaType::Gguf));
        assert!(MediaType::Safetensors.matches(&MediaType::PackageSafetensors));
        assert!(MediaType::PackageSafetensors.matches(&MediaType::Safetensors));
        assert!(MediaType::Dduf.matches(&MediaType::Dduf));
        assert!(!MediaType::Dduf.matches(&MediaType::Gguf));
        assert!(!MediaType::License.matches(&MediaType::ChatTemplate));
    }

    #[test]
    fn test_weight_and_config_sets() {
        assert!(MediaType::Gguf.is_weight());
        assert!(MediaType::PackageSafetensors.is_weight());
        assert!(!MediaType::License.is_weight());
        assert!(MediaType::ConfigV02.is_config());
        assert!(MediaType::PackageConfig.is_config());
        assert!(!MediaType::Gguf.is_config());
    }
}
