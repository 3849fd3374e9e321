use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = AtomsError> = std::result::Result<T, E>;

#[derive(Debug, Error, Diagnostic)]
pub enum AtomsError {
    #[error("unknown dataset: {id}")]
    #[diagnostic(help("check the spelling of the dataset id"))]
    UnknownDataset { id: String },

    #[error("invalid dataset id {id:?}")]
    #[diagnostic(help(
        "dataset ids start with a letter or digit and use only letters, digits, '.', '_', '+', '-'"
    ))]
    InvalidDatasetId { id: String },

    #[error("dataset {id} is not cached locally and no remote database is configured")]
    #[diagnostic(help(
        "point LOAD_ATOMS_BASE_URL (or base_remote_url in load-atoms.json) at a manifest database"
    ))]
    NoRemoteDatabase { id: String },

    #[error("invalid dataset manifest at {location}:\n  - {}", .problems.join("\n  - "))]
    #[diagnostic(help(
        "this may be a stale copy of the manifest on disk; delete it and try again"
    ))]
    InvalidManifest {
        location: String,
        problems: Vec<String>,
    },

    #[error("failed to parse dataset manifest at {location}: {message}")]
    ManifestParse { location: String, message: String },

    #[error(
        "dataset {dataset} requires load-atoms >= {required} (current version: {current})"
    )]
    #[diagnostic(help("upgrade load-atoms to load this dataset"))]
    UnsupportedVersion {
        dataset: String,
        required: String,
        current: String,
    },

    #[error("could not fetch {url}: response code {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("failed to download {} file(s): {}", .failures.len(), .failures.join(", "))]
    DownloadFailed { failures: Vec<String> },

    #[error("checksum mismatch for {file} in dataset {dataset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        dataset: String,
        file: String,
        expected: String,
        actual: String,
    },

    #[error("failed to import dataset {dataset}: {message}")]
    #[diagnostic(help(
        "please file an issue at https://github.com/jla-gardner/load-atoms/issues"
    ))]
    ImportFailed { dataset: String, message: String },

    #[error("index {index} is out of range for a dataset of {len} structures")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("boolean mask has {actual} entries but the dataset has {expected} structures")]
    MaskLength { expected: usize, actual: usize },

    #[error("unknown key {key}. Available keys are: {}", .available.join(", "))]
    UnknownKey { key: String, available: Vec<String> },

    #[error("k must be at least 2, got {k}")]
    InvalidFolds { k: usize },

    #[error("keep-ratio splits are only supported when shuffling")]
    KeepRatioRequiresShuffle,

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("the {attribute} of a structure read from a paged dataset are read-only")]
    ReadOnly { attribute: &'static str },

    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    #[error("the provided path does not exist: {0}")]
    MissingPath(String),

    #[error("failed to read config file: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl AtomsError {
    /// Errors caused by how the caller used a dataset, rather than by data or I/O.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            AtomsError::IndexOutOfRange { .. }
                | AtomsError::InvalidDatasetId { .. }
                | AtomsError::InvalidSelection(_)
                | AtomsError::MaskLength { .. }
                | AtomsError::UnknownKey { .. }
                | AtomsError::InvalidFolds { .. }
                | AtomsError::KeepRatioRequiresShuffle
                | AtomsError::InvalidSplit(_)
                | AtomsError::ReadOnly { .. }
        )
    }

    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            AtomsError::HttpStatus { .. }
                | AtomsError::Http { .. }
                | AtomsError::DownloadFailed { .. }
        )
    }
}
