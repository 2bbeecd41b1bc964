use async_recursion::async_recursion;
use async_trait::async_trait;
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::config::Config;
use crate::error;
use crate::format::{self, Format, FormatAdapter};
use crate::mediatype::MediaType;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";
/// Metadata arrays longer than this are dropped from the config to keep
/// the config blob small (token vocabularies can run to 100k+ entries).
const MAX_ARRAY_KEEP: usize = 50;
/// Sanity caps on header fields so a corrupt file cannot drive huge reads
const MAX_STRING_LEN: u64 = 1 << 20;
const MAX_KV_COUNT: u64 = 1 << 20;
const MAX_TENSOR_DIMS: u32 = 8;

const KEY_ARCHITECTURE: &str = "general.architecture";
const KEY_FILE_TYPE: &str = "general.file_type";
const KEY_PARAMETER_COUNT: &str = "general.parameter_count";

pub struct GgufAdapter;

#[async_trait]
impl FormatAdapter for GgufAdapter {
    fn format(&self) -> Format {
        Format::Gguf
    }

    fn media_type(&self) -> MediaType {
        MediaType::Gguf
    }

    fn discover_shards(&self, path: &Path) -> crate::Result<Vec<PathBuf>> {
        format::discover_shards(path)
    }

    async fn extract_config(&self, paths: &[PathBuf]) -> crate::Result<Config> {
        let first = paths.first().ok_or(error::Error::EmptyPathList)?;
        let header = Header::read(first.as_path()).await?;
        let mut size: u64 = 0;
        for path in paths {
            size += tokio::fs::metadata(path)
                .await
                .context(error::FileSnafu)?
                .len();
        }
        Ok(Config {
            format: Some(Format::Gguf),
            quantization: Some(header.quantization().to_string()),
            parameters: Some(format::format_parameters(header.parameters)),
            architecture: header.metadata.get(KEY_ARCHITECTURE).cloned(),
            size: Some(format::format_size(size)),
            gguf: Some(header.metadata),
            ..Default::default()
        })
    }
}

/// Decoded GGUF header of the first shard: the key-value metadata map
/// (stringified), the parameter count, and the file type.
struct Header {
    metadata: HashMap<String, String>,
    parameters: u64,
    file_type: Option<u32>,
}

impl Header {
    async fn read(path: &Path) -> crate::Result<Self> {
        let file = File::open(path).await.context(error::FileSnafu)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic).await?;
        if magic != GGUF_MAGIC {
            return error::HeaderInvalidSnafu {
                reason: "bad gguf magic",
            }
            .fail();
        }
        let version = read_u32(&mut reader).await?;
        if version < 2 {
            return error::HeaderInvalidSnafu {
                reason: format!("unsupported gguf version {version}"),
            }
            .fail();
        }
        let tensor_count = read_u64(&mut reader).await?;
        let kv_count = read_u64(&mut reader).await?;
        if kv_count > MAX_KV_COUNT {
            return error::HeaderInvalidSnafu {
                reason: format!("implausible key-value count {kv_count}"),
            }
            .fail();
        }

        let mut metadata = HashMap::new();
        let mut file_type = None;
        let mut parameters = None;
        for _ in 0..kv_count {
            let key = read_string(&mut reader).await?;
            let value_type = read_u32(&mut reader).await?;
            let value = read_value(&mut reader, value_type).await?;
            if key == KEY_FILE_TYPE {
                if let Value::Uint(raw) = value {
                    file_type = Some(raw as u32);
                }
            }
            if key == KEY_PARAMETER_COUNT {
                if let Value::Uint(raw) = value {
                    parameters = Some(raw);
                }
            }
            if let Value::Array(_, len) = &value {
                if *len > MAX_ARRAY_KEEP {
                    continue;
                }
            }
            metadata.insert(key, value.render());
        }

        // Older writers omit the parameter count; fall back to summing
        // tensor shapes from the tensor info section.
        let parameters = match parameters {
            Some(parameters) => parameters,
            None => read_tensor_parameters(&mut reader, tensor_count).await?,
        };

        Ok(Self {
            metadata,
            parameters,
            file_type,
        })
    }

    fn quantization(&self) -> &'static str {
        match self.file_type {
            Some(file_type) => file_type_name(file_type),
            None => "unknown",
        }
    }
}

async fn read_tensor_parameters<R>(reader: &mut R, tensor_count: u64) -> crate::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut parameters: u64 = 0;
    for _ in 0..tensor_count {
        let _name = read_string(reader).await?;
        let n_dims = read_u32(reader).await?;
        if n_dims > MAX_TENSOR_DIMS {
            return error::HeaderInvalidSnafu {
                reason: format!("tensor with {n_dims} dimensions"),
            }
            .fail();
        }
        let mut elements: u64 = 1;
        for _ in 0..n_dims {
            elements = elements.saturating_mul(read_u64(reader).await?);
        }
        let _ggml_type = read_u32(reader).await?;
        let _offset = read_u64(reader).await?;
        parameters = parameters.saturating_add(elements);
    }
    Ok(parameters)
}

/// GGUF metadata value, kept only long enough to stringify
enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Array(Vec<Value>, usize),
}

impl Value {
    fn render(&self) -> String {
        match self {
            Self::Uint(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Str(value) => value.clone(),
            Self::Array(values, _) => {
                let rendered: Vec<String> = values.iter().map(Value::render).collect();
                format!("[{}]", rendered.join(","))
            }
        }
    }
}

#[async_recursion]
async fn read_value<R>(reader: &mut R, value_type: u32) -> crate::Result<Value>
where
    R: AsyncRead + Unpin + Send,
{
    Ok(match value_type {
        0 => Value::Uint(read_u8(reader).await? as u64),
        1 => Value::Int(read_u8(reader).await? as i8 as i64),
        2 => Value::Uint(read_u16(reader).await? as u64),
        3 => Value::Int(read_u16(reader).await? as i16 as i64),
        4 => Value::Uint(read_u32(reader).await? as u64),
        5 => Value::Int(read_u32(reader).await? as i32 as i64),
        6 => Value::Float(f32::from_bits(read_u32(reader).await?) as f64),
        7 => Value::Bool(read_u8(reader).await? != 0),
        8 => Value::Str(read_string(reader).await?),
        9 => {
            let element_type = read_u32(reader).await?;
            let count = read_u64(reader).await?;
            if count > MAX_KV_COUNT {
                return error::HeaderInvalidSnafu {
                    reason: format!("implausible array length {count}"),
                }
                .fail();
            }
            let mut values = Vec::with_capacity(count.min(MAX_ARRAY_KEEP as u64) as usize);
            for _ in 0..count {
                let value = read_value(reader, element_type).await?;
                if values.len() <= MAX_ARRAY_KEEP {
                    values.push(value);
                }
            }
            Value::Array(values, count as usize)
        }
        10 => Value::Uint(read_u64(reader).await?),
        11 => Value::Int(read_u64(reader).await? as i64),
        12 => Value::Float(f64::from_bits(read_u64(reader).await?)),
        other => {
            return error::HeaderInvalidSnafu {
                reason: format!("unknown metadata value type {other}"),
            }
            .fail()
        }
    })
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.context(error::FileSnafu)?;
    Ok(())
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf).await?;
    Ok(buf[0])
}

async fn read_u16<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf).await?;
    Ok(u16::from_le_bytes(buf))
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<String> {
    let len = read_u64(reader).await?;
    if len > MAX_STRING_LEN {
        return error::HeaderInvalidSnafu {
            reason: format!("string of {len} bytes in header"),
        }
        .fail();
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf).await?;
    Ok(String::from_utf8_lossy(buf.as_slice()).into_owned())
}

/// llama.cpp file-type enumeration to quantization token
fn file_type_name(file_type: u32) -> &'static str {
    match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        21 => "Q2_K_S",
        22 => "IQ3_XS",
        23 => "IQ3_XXS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        26 => "IQ3_S",
        27 => "IQ3_M",
        28 => "IQ2_S",
        29 => "IQ2_M",
        30 => "IQ4_XS",
        31 => "IQ1_M",
        32 => "BF16",
        _ => "unknown",
    }
}
