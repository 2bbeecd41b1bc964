use std::path::Path;

use crate::mediatype::MediaType;

/// Semantic kind of a model file, decided purely from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    WeightGguf,
    WeightSafetensors,
    WeightDduf,
    Config,
    License,
    ChatTemplate,
    Unknown,
}

const LICENSE_TOKENS: &[&str] = &["license", "licence", "copying", "notice"];
const CONFIG_SUFFIXES: &[&str] = &[".md", ".txt", ".json", ".vocab"];

/// Classify a path by its lowercased basename. Matching precedence is
/// weights, chat templates, licenses, configs, then unknown.
pub fn classify(path: &Path) -> FileKind {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return FileKind::Unknown;
    };
    let name = name.to_ascii_lowercase();
    if name.ends_with(".gguf") {
        return FileKind::WeightGguf;
    }
    if name.ends_with(".safetensors") {
        return FileKind::WeightSafetensors;
    }
    if name.ends_with(".dduf") {
        return FileKind::WeightDduf;
    }
    if name.ends_with(".jinja") || name.contains("chat_template") {
        return FileKind::ChatTemplate;
    }
    if LICENSE_TOKENS.iter().any(|token| name.contains(token)) {
        return FileKind::License;
    }
    if CONFIG_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        || name == "tokenizer.model"
    {
        return FileKind::Config;
    }
    FileKind::Unknown
}

impl FileKind {
    pub fn is_weight(&self) -> bool {
        matches!(
            self,
            Self::WeightGguf | Self::WeightSafetensors | Self::WeightDduf
        )
    }

    /// Layer media type used when packing a file of this kind. Config and
    /// unknown files are both packed as generic model files; their
    /// semantic role is recoverable from the filepath annotation.
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::WeightGguf => MediaType::Gguf,
            Self::WeightSafetensors => MediaType::Safetensors,
            Self::WeightDduf => MediaType::Dduf,
            Self::ChatTemplate => MediaType::ChatTemplate,
            Self::License => MediaType::License,
            Self::Config | Self::Unknown => MediaType::ModelFile,
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{classify, FileKind};

    #[test]
    fn test_classification_table() {
        let cases = [
            ("model.gguf", FileKind::WeightGguf),
            ("MODEL.GGUF", FileKind::WeightGguf),
            ("w-00001-of-00002.safetensors", FileKind::WeightSafetensors),
            ("pipeline.dduf", FileKind::WeightDduf),
            ("template.jinja", FileKind::ChatTemplate),
            ("chat_template.json", FileKind::ChatTemplate),
            ("LICENSE", FileKind::License),
            ("licence.txt", FileKind::License),
            ("COPYING", FileKind::License),
            ("NOTICE.md", FileKind::License),
            ("README.md", FileKind::Config),
            ("config.json", FileKind::Config),
            ("vocab.txt", FileKind::Config),
            ("spiece.vocab", FileKind::Config),
            ("tokenizer.model", FileKind::Config),
            ("weights.bin", FileKind::Unknown),
            ("Makefile", FileKind::Unknown),
        ];
        for (name, expected) in cases {
            assert_eq!(classify(Path::new(name)), expected, "file: {name}");
        }
    }

    #[test]
    fn test_precedence() {
        // weight suffix wins over a license token in the name
        assert_eq!(
            classify(Path::new("license-model.gguf")),
            FileKind::WeightGguf
        );
        // chat template wins over the config json suffix
        assert_eq!(
            classify(Path::new("chat_template.json")),
            FileKind::ChatTemplate
        );
        // license token wins over the config md suffix
        assert_eq!(classify(Path::new("LICENSE.md")), FileKind::License);
    }

    #[test]
    fn test_classifies_basename_only() {
        assert_eq!(
            classify(Path::new("license/config.json")),
            FileKind::Config
        );
    }
}
