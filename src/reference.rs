use snafu::ResultExt;
use std::fmt;
use std::fmt::Formatter;
use std::net::Ipv4Addr;
use std::str::FromStr;
use url::Url;

use crate::digest::Digest;
use crate::error;

/// Environment knob naming the registry used for bare references
pub const DEFAULT_REGISTRY_ENV: &str = "DEFAULT_REGISTRY";
/// Environment knob listing registries reached over plain HTTP
pub const INSECURE_REGISTRY_ENV: &str = "INSECURE_REGISTRY";

const DOCKER_HUB: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// What a reference points at within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest(digest) => f.write_fmt(format_args!("{digest}")),
        }
    }
}

/// A model reference of the form `[registry[:port]/]repo[:tag|@digest]`.
/// A missing registry resolves through `DEFAULT_REGISTRY` and falls back
/// to Docker Hub, where single-segment repositories gain the `library/`
/// prefix. A missing tag becomes `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    target: Target,
}

impl FromStr for Reference {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return error::MalformedReferenceSnafu {
                reference: s.to_string(),
                reason: "empty reference",
            }
            .fail();
        }
        let (registry, remainder) = match s.split_once('/') {
            Some((head, rest)) if looks_like_registry(head) => (head.to_string(), rest),
            _ => (default_registry(), s),
        };
        let (repository, target) = if let Some((repository, digest)) = remainder.split_once('@') {
            (repository.to_string(), Target::Digest(Digest::from_str(digest)?))
        } else {
            // a colon after the last slash separates the tag; earlier
            // colons belong to the registry port
            let last_segment_start = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
            match remainder[last_segment_start..].split_once(':') {
                Some((name, tag)) => (
                    format!("{}{}", &remainder[..last_segment_start], name),
                    Target::Tag(tag.to_string()),
                ),
                None => (
                    remainder.to_string(),
                    Target::Tag(DEFAULT_TAG.to_string()),
                ),
            }
        };
        if repository.is_empty() {
            return error::MalformedReferenceSnafu {
                reference: s.to_string(),
                reason: "missing repository",
            }
            .fail();
        }
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        match &target {
            Target::Tag(tag) if tag.is_empty() => error::MalformedReferenceSnafu {
                reference: s.to_string(),
                reason: "empty tag",
            }
            .fail(),
            _ => Ok(Self {
                registry,
                repository,
                target,
            }),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let separator = match self.target {
            Target::Tag(_) => ":",
            Target::Digest(_) => "@",
        };
        f.write_fmt(format_args!(
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.target
        ))
    }
}

impl Reference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Plain HTTP is used only for loopback hosts, `*.local` names, and
    /// registries listed in `INSECURE_REGISTRY`.
    pub fn is_insecure(&self) -> bool {
        if std::env::var(INSECURE_REGISTRY_ENV)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .any(|entry| entry == self.registry)
            })
            .unwrap_or(false)
        {
            return true;
        }
        let host = self
            .registry
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(self.registry.as_str());
        if host == "localhost" || host == "::1" || host == "[::1]" || host.ends_with(".local") {
            return true;
        }
        host.parse::<Ipv4Addr>()
            .map(|ip| ip.octets()[0] == 127)
            .unwrap_or(false)
    }

    fn base_url(&self) -> crate::Result<Url> {
        let scheme = if self.is_insecure() { "http" } else { "https" };
        Url::parse(format!("{scheme}://{}", self.registry).as_str()).context(error::UrlSnafu)
    }

    pub fn manifest_url(&self) -> crate::Result<Url> {
        self.base_url()?
            .join(format!("/v2/{}/manifests/{}", self.repository, self.target).as_str())
            .context(error::UrlSnafu)
    }

    pub fn blob_url(&self, digest: &Digest) -> crate::Result<Url> {
        self.base_url()?
            .join(format!("/v2/{}/blobs/{digest}", self.repository).as_str())
            .context(error::UrlSnafu)
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

fn default_registry() -> String {
    std::env::var(DEFAULT_REGISTRY_ENV).unwrap_or_else(|_| DOCKER_HUB.to_string())
}
