use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error;

/// Buffer size used when streaming content through a hasher
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Digest algorithms accepted by this crate. Anything outside this
/// safelist is rejected at parse time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Length of the hex encoding for this algorithm
    pub fn hex_length(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl FromStr for Algorithm {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => error::InvalidAlgorithmSnafu {
                algorithm: s.to_string(),
            }
            .fail(),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

/// A content digest of the form `<algorithm>:<hex>`. The same value serves
/// as both the blob digest and the diff ID since layers are stored
/// uncompressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Shortened hex form used for log lines and progress labels
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }

    /// Hash a byte slice with sha256
    pub fn sha256_bytes(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Self {
            algorithm: Algorithm::Sha256,
            hex: base16::encode_lower(hash.as_slice()),
        }
    }
}

impl FromStr for Digest {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, hex)) = s.split_once(':') else {
            return error::InvalidDigestSnafu {
                digest: s.to_string(),
                reason: "expected '<algorithm>:<hex>'",
            }
            .fail();
        };
        let algorithm = Algorithm::from_str(algorithm)?;
        if hex.len() != algorithm.hex_length() {
            return error::InvalidDigestSnafu {
                digest: s.to_string(),
                reason: format!(
                    "expected {} hex characters, got {}",
                    algorithm.hex_length(),
                    hex.len()
                ),
            }
            .fail();
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return error::InvalidDigestSnafu {
                digest: s.to_string(),
                reason: "non-hexadecimal characters in digest",
            }
            .fail();
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.algorithm, self.hex))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Self::from_str(string.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Stream a reader through an incremental sha256 hasher, returning the
/// digest and the number of bytes consumed. Callers wrap the io error with
/// the context of their operation.
pub async fn sha256_stream<R>(reader: &mut R) -> std::io::Result<(Digest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    let hash = hasher.finalize();
    Ok((
        Digest {
            algorithm: Algorithm::Sha256,
            hex: base16::encode_lower(hash.as_slice()),
        },
        total,
    ))
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{Algorithm, Digest};

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(Algorithm::from_str("sha256").unwrap(), Algorithm::Sha256);
        assert_eq!(Algorithm::from_str("sha512").unwrap(), Algorithm::Sha512);
        assert!(Algorithm::from_str("md5").is_err());
    }

    #[test]
    fn test_digest_round_trip() {
        let digest = Digest::from_str(EMPTY_SHA256).unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), EMPTY_SHA256);
        assert_eq!(digest.short(), "e3b0c44298fc");
    }

    #[test]
    fn test_digest_rejects_malformed() {
        // no separator
        assert!(Digest::from_str("sha256").is_err());
        // bad algorithm
        assert!(Digest::from_str("md5:abcd").is_err());
        // wrong length
        assert!(Digest::from_str("sha256:abcd").is_err());
        // right length, non-hex characters
        let bad = format!("sha256:{}", "z".repeat(64));
        assert!(Digest::from_str(bad.as_str()).is_err());
        // extra separator splits only once, leaving invalid hex
        let bad = format!("sha256:{}:{}", "a".repeat(32), "b".repeat(31));
        assert!(Digest::from_str(bad.as_str()).is_err());
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(Digest::sha256_bytes(b"").to_string(), EMPTY_SHA256);
    }

    #[tokio::test]
    async fn test_sha256_stream() {
        let data = b"0123456789abcdefghijklmnopqrstuvwxyz ABCDE";
        let (digest, size) = super::sha256_stream(&mut &data[..]).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, Digest::sha256_bytes(data));
    }
}
