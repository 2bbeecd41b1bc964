use snafu::Snafu;
use tokio::task::JoinError;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("reference '{reference}' matches more than one model"))]
    AmbiguousReference { reference: String },
    #[snafu(display("failed to interact with tar archive: {source}"))]
    Archive { source: std::io::Error },
    #[snafu(display("failed to authorize with model repository: {reason}"))]
    Authorization { reason: String },
    #[snafu(display("failed to read blob: {source}"))]
    BlobRead { source: std::io::Error },
    #[snafu(display("failed to write blob: {source}"))]
    BlobWrite { source: std::io::Error },
    #[snafu(display("model already has a config archive layer"))]
    ConfigArchiveExists,
    #[snafu(display("failed to deserialize model configuration: {source}"))]
    ConfigDeserialize { source: serde_json::Error },
    #[snafu(display("blob digest mismatch: expected {expected}, got {actual}"))]
    DigestMismatch { expected: String, actual: String },
    #[snafu(display("failed to perform operation with directory: {source}"))]
    Directory { source: std::io::Error },
    #[snafu(display("failed to download {failed} of {total} files from repository:\n{reasons}"))]
    DownloadSet {
        failed: usize,
        total: usize,
        reasons: String,
    },
    #[snafu(display("no paths were provided to build a model from"))]
    EmptyPathList,
    #[snafu(display("failed to interact with local file: {source}"))]
    File { source: std::io::Error },
    #[snafu(display("layer {digest} is missing the filepath annotation"))]
    FilepathMissing { digest: String },
    #[snafu(display("mixed weight formats in path list"))]
    FormatMixed,
    #[snafu(display("unable to determine weight format of '{path}'"))]
    FormatUnknown { path: String },
    #[snafu(display("failed to hard link blob into bundle: {source}"))]
    Hardlink { source: std::io::Error },
    #[snafu(display("invalid weight file header: {reason}"))]
    HeaderInvalid { reason: String },
    #[snafu(display("weight file header of {size} bytes exceeds the limit"))]
    HeaderTooLarge { size: u64 },
    #[snafu(display("operation was interrupted"))]
    Interrupted,
    #[snafu(display("invalid algorithm in digest: {algorithm}"))]
    InvalidAlgorithm { algorithm: String },
    #[snafu(display("invalid digest '{digest}': {reason}"))]
    InvalidDigest { digest: String, reason: String },
    #[snafu(display("layer {digest} has no local file backing it"))]
    LayerMissingLocally { digest: String },
    #[snafu(display("failed to read from layer: {source}"))]
    LayerRead { source: std::io::Error },
    #[snafu(display("failed to write layer: {source}"))]
    LayerWrite { source: std::io::Error },
    #[snafu(display("malformed model reference '{reference}': {reason}"))]
    MalformedReference { reference: String, reason: String },
    #[snafu(display("failed to deserialize manifest: {source}"))]
    ManifestDeserialize { source: serde_json::Error },
    #[snafu(display("no model found matching '{reference}'"))]
    ModelNotFound { reference: String },
    #[snafu(display("no weight files found under '{dir}'"))]
    NoWeightsFound { dir: String },
    #[snafu(display("path '{path}' escapes its base directory"))]
    PathTraversal { path: String },
    #[snafu(display("failed to emit progress message: {source}"))]
    ProgressWrite { source: std::io::Error },
    #[snafu(display("file '{path}' not found in repository"))]
    RemoteNotFound { path: String },
    #[snafu(display("repository returned status {status} for '{path}'"))]
    RemoteStatus {
        status: reqwest::StatusCode,
        path: String,
    },
    #[snafu(display("failed to make request to model repository: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("failed to parse response from model repository: {source}"))]
    ResponseDeserialize { source: reqwest::Error },
    #[snafu(display("failed to serialize to json: {source}"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("incomplete shard set for '{prefix}': found {found} of {total} shards"))]
    ShardsIncomplete {
        prefix: String,
        found: usize,
        total: usize,
    },
    #[snafu(display("failed to read tag index: {source}"))]
    TagsDeserialize { source: serde_json::Error },
    #[snafu(display("failed to wait for background task: {source}"))]
    TaskJoin { source: JoinError },
    #[snafu(display("failed to create temporary directory: {source}"))]
    Temp { source: std::io::Error },
    #[snafu(display("invalid url detected: {source}"))]
    Url { source: url::ParseError },
}

impl Error {
    /// Whether a failed operation is worth retrying with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Interrupted
                | Error::Request { .. }
                | Error::RemoteStatus { .. }
                | Error::BlobRead { .. }
                | Error::BlobWrite { .. }
                | Error::DigestMismatch { .. }
        )
    }
}
