//! Declarative description of one dataset: provenance, license, the remote
//! files it is built from and their checksums.
//!
//! Manifests are JSON documents. Every field problem is collected before an
//! [`AtomsError::InvalidManifest`] is reported, so a broken manifest is fixed
//! in one round trip.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crate::checksum::ContentHash;
use crate::error::AtomsError;

pub const FRONTEND_URL: &str = "https://jla-gardner.github.io/load-atoms/datasets";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").unwrap());
static FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.+-][A-Za-z0-9_.+ -]*$").unwrap());

static KNOWN_MANIFESTS: RwLock<BTreeMap<String, Arc<DatasetManifest>>> =
    parking_lot::const_rwlock(BTreeMap::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Benchmarks,
    #[serde(rename = "Potential Fitting")]
    PotentialFitting,
    #[serde(rename = "Synthetic Data")]
    SyntheticData,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Benchmarks,
        Category::PotentialFitting,
        Category::SyntheticData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Benchmarks => "Benchmarks",
            Category::PotentialFitting => "Potential Fitting",
            Category::SyntheticData => "Synthetic Data",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| {
                format!(
                    "invalid category {value:?}: must be one of {}",
                    Category::ALL.map(Category::as_str).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    #[default]
    Memory,
    #[serde(alias = "lmdb")]
    Paged,
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "memory" => Ok(StorageFormat::Memory),
            "paged" | "lmdb" => Ok(StorageFormat::Paged),
            other => Err(format!(
                "invalid storage format {other:?}: must be \"memory\" or \"paged\""
            )),
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageFormat::Memory => write!(f, "memory"),
            StorageFormat::Paged => write!(f, "paged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum License {
    CcByNcSa4,
    CcByNc4,
    CcBy4,
    Cc0,
    Mit,
    Gpl3,
}

impl License {
    pub const ALL: [License; 6] = [
        License::CcByNcSa4,
        License::CcByNc4,
        License::CcBy4,
        License::Cc0,
        License::Mit,
        License::Gpl3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            License::CcByNcSa4 => "CC BY-NC-SA 4.0",
            License::CcByNc4 => "CC BY-NC 4.0",
            License::CcBy4 => "CC BY 4.0",
            License::Cc0 => "CC0",
            License::Mit => "MIT",
            License::Gpl3 => "GPLv3",
        }
    }

    pub fn url(self) -> &'static str {
        match self {
            License::CcByNcSa4 => "https://creativecommons.org/licenses/by-nc-sa/4.0/deed.en",
            License::CcByNc4 => "https://creativecommons.org/licenses/by-nc/4.0/deed.en",
            License::CcBy4 => "https://creativecommons.org/licenses/by/4.0/deed.en",
            License::Cc0 => "https://creativecommons.org/publicdomain/zero/1.0/",
            License::Mit => "https://opensource.org/licenses/MIT",
            License::Gpl3 => "https://www.gnu.org/licenses/gpl-3.0.html",
        }
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for License {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        License::ALL
            .into_iter()
            .find(|license| license.name() == value)
            .ok_or_else(|| {
                format!(
                    "invalid license {value:?}: must be one of {}",
                    License::ALL.map(License::name).join(", ")
                )
            })
    }
}

impl Serialize for License {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyDoc {
    pub desc: String,
    #[serde(default)]
    pub units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub url: Option<String>,
    pub hash: ContentHash,
}

/// A remote resource the download phase has to fetch and verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub url: String,
    pub expected_hash: ContentHash,
    pub local_name: String,
}

impl RemoteFile {
    /// Local name defaults to the last path segment of the url.
    pub fn new(url: impl Into<String>, expected_hash: ContentHash) -> Self {
        let url = url.into();
        let local_name = url_basename(&url).to_string();
        Self {
            url,
            expected_hash,
            local_name,
        }
    }

    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = local_name.into();
        self
    }
}

pub fn url_basename(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct DatasetManifest {
    pub name: String,
    pub year: i32,
    pub description: String,
    pub category: Category,
    pub storage_format: StorageFormat,
    pub license: Option<License>,
    pub citation: Option<String>,
    pub files: Vec<ManifestFile>,
    pub representative_structure: Option<usize>,
    pub per_atom_properties: BTreeMap<String, PropertyDoc>,
    pub per_structure_properties: BTreeMap<String, PropertyDoc>,
    #[serde(serialize_with = "serialize_version")]
    pub minimum_required_version: Option<semver::Version>,
}

fn serialize_version<S>(version: &Option<semver::Version>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match version {
        Some(version) => serializer.serialize_some(&version.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: String,
    year: i32,
    description: String,
    category: String,
    #[serde(default, alias = "format")]
    storage_format: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    citation: Option<String>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    representative_structure: Option<usize>,
    #[serde(default)]
    per_atom_properties: Option<BTreeMap<String, PropertyDoc>>,
    #[serde(default)]
    per_structure_properties: Option<BTreeMap<String, PropertyDoc>>,
    #[serde(default, alias = "minimum_load_atoms_version")]
    minimum_required_version: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    name: String,
    #[serde(default)]
    url: Option<String>,
    hash: String,
}

impl RawManifest {
    fn validate(self) -> Result<DatasetManifest, Vec<String>> {
        let mut problems = Vec::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            problems.push("name: must not be empty".to_string());
        } else if !NAME_PATTERN.is_match(&name) {
            problems.push(format!(
                "name: {name:?} may only contain letters, digits, '.', '_', '+' and '-'"
            ));
        }

        let category = self
            .category
            .parse::<Category>()
            .map_err(|err| problems.push(format!("category: {err}")))
            .ok();

        let storage_format = match self.storage_format.as_deref() {
            None => Some(StorageFormat::default()),
            Some(raw) => raw
                .parse::<StorageFormat>()
                .map_err(|err| problems.push(format!("storage_format: {err}")))
                .ok(),
        };

        let license = match self.license.as_deref() {
            None => None,
            Some(raw) => raw
                .trim()
                .parse::<License>()
                .map_err(|err| problems.push(format!("license: {err}")))
                .ok(),
        };

        let citation = self.citation.map(|raw| raw.trim().to_string());
        if let Some(citation) = &citation {
            if !(citation.starts_with('@') && citation.ends_with('}')) {
                problems.push(format!(
                    "citation: does not look like a BibTeX entry: {}",
                    preview(citation)
                ));
            }
        }

        let raw_files = match (self.files, self.filename, self.hash) {
            (Some(files), None, None) => {
                if files.is_empty() {
                    problems.push("files: at least one file is required".to_string());
                }
                files
            }
            (None, Some(filename), Some(hash)) => vec![RawFile {
                name: filename,
                url: None,
                hash,
            }],
            (None, Some(_), None) => {
                problems.push("hash: required alongside filename".to_string());
                Vec::new()
            }
            (None, None, Some(_)) => {
                problems.push("filename: required alongside hash".to_string());
                Vec::new()
            }
            (None, None, None) => {
                problems.push("files: at least one file is required".to_string());
                Vec::new()
            }
            (Some(_), _, _) => {
                problems.push(
                    "files: use either a files list or the filename/hash shorthand, not both"
                        .to_string(),
                );
                Vec::new()
            }
        };

        let mut files = Vec::with_capacity(raw_files.len());
        for (index, file) in raw_files.into_iter().enumerate() {
            if !FILE_PATTERN.is_match(&file.name) || file.name.contains("..") {
                problems.push(format!(
                    "files[{index}].name: {:?} is not a plain file name",
                    file.name
                ));
            }
            match file.hash.parse::<ContentHash>() {
                Ok(hash) => files.push(ManifestFile {
                    name: file.name,
                    url: file.url,
                    hash,
                }),
                Err(err) => problems.push(format!("files[{index}].hash: {err}")),
            }
        }

        let minimum_required_version = match self.minimum_required_version {
            None | Some(serde_json::Value::Null) => None,
            Some(raw) => {
                let text = match raw {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                parse_version(&text)
                    .map_err(|err| problems.push(format!("minimum_required_version: {err}")))
                    .ok()
            }
        };

        if !problems.is_empty() {
            return Err(problems);
        }

        Ok(DatasetManifest {
            name,
            year: self.year,
            description: self.description,
            category: category.unwrap_or(Category::Benchmarks),
            storage_format: storage_format.unwrap_or_default(),
            license,
            citation,
            files,
            representative_structure: self.representative_structure,
            per_atom_properties: self.per_atom_properties.unwrap_or_default(),
            per_structure_properties: self.per_structure_properties.unwrap_or_default(),
            minimum_required_version,
        })
    }
}

impl TryFrom<RawManifest> for DatasetManifest {
    type Error = String;

    fn try_from(raw: RawManifest) -> Result<Self, Self::Error> {
        raw.validate().map_err(|problems| problems.join("; "))
    }
}

/// Accepts `1.2.3` as well as the shorter `1.2` / `1` spellings.
fn parse_version(text: &str) -> Result<semver::Version, String> {
    let trimmed = text.trim();
    let padded = match trimmed.matches('.').count() {
        0 => format!("{trimmed}.0.0"),
        1 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    semver::Version::parse(&padded).map_err(|err| format!("invalid version {text:?}: {err}"))
}

fn preview(text: &str) -> String {
    let mut shortened: String = text.chars().take(40).collect();
    if shortened.len() < text.len() {
        shortened.push_str("...");
    }
    shortened
}

impl DatasetManifest {
    pub fn parse(source: &str, location: &str) -> Result<Self, AtomsError> {
        let raw: RawManifest =
            serde_json::from_str(source).map_err(|err| AtomsError::ManifestParse {
                location: location.to_string(),
                message: err.to_string(),
            })?;
        raw.validate()
            .map_err(|problems| AtomsError::InvalidManifest {
                location: location.to_string(),
                problems,
            })
    }

    pub fn from_file(path: &Path) -> Result<Self, AtomsError> {
        let content = fs::read_to_string(path)
            .map_err(|err| AtomsError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn to_json(&self) -> Result<String, AtomsError> {
        serde_json::to_string_pretty(self).map_err(|err| AtomsError::Filesystem(err.to_string()))
    }

    pub fn remote_locations(&self, base_url: &str) -> Vec<RemoteFile> {
        let base = base_url.trim_end_matches('/');
        self.files
            .iter()
            .map(|file| RemoteFile {
                url: file
                    .url
                    .clone()
                    .unwrap_or_else(|| format!("{base}/{}/{}", self.name, file.name)),
                expected_hash: file.hash.clone(),
                local_name: file.name.clone(),
            })
            .collect()
    }

    pub fn check_version(&self, current: &semver::Version) -> Result<(), AtomsError> {
        match &self.minimum_required_version {
            Some(required) if required > current => Err(AtomsError::UnsupportedVersion {
                dataset: self.name.clone(),
                required: required.to_string(),
                current: current.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Ids become directory and file names under the cache root, so they are
/// held to the same pattern as manifest names.
pub fn is_valid_dataset_id(dataset_id: &str) -> bool {
    NAME_PATTERN.is_match(dataset_id)
}

pub fn manifest_url(base_url: &str, dataset_id: &str) -> String {
    format!(
        "{}/{dataset_id}/{dataset_id}.json",
        base_url.trim_end_matches('/')
    )
}

/// Registry key for a dataset's importer: lower-cased, `-` replaced by `_`.
pub fn importer_name(dataset_id: &str) -> String {
    dataset_id.to_lowercase().replace('-', "_")
}

pub fn frontend_url(dataset_name: &str) -> String {
    format!("{FRONTEND_URL}/{dataset_name}.html")
}

/// Parses every `*.json` manifest below `directory` into the process-wide
/// registry, returning how many were loaded.
pub fn load_all_manifests(directory: &Path) -> Result<usize, AtomsError> {
    let mut loaded = Vec::new();
    let mut stack = vec![directory.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| AtomsError::Filesystem(format!("read {}: {err}", dir.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|err| AtomsError::Filesystem(err.to_string()))?
                .path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                loaded.push(DatasetManifest::from_file(&path)?);
            }
        }
    }
    let count = loaded.len();
    let mut registry = KNOWN_MANIFESTS.write();
    for manifest in loaded {
        registry.insert(manifest.name.clone(), Arc::new(manifest));
    }
    Ok(count)
}

pub fn known_manifest(dataset_id: &str) -> Option<Arc<DatasetManifest>> {
    KNOWN_MANIFESTS.read().get(dataset_id).cloned()
}

pub fn is_known_dataset(dataset_id: &str) -> bool {
    KNOWN_MANIFESTS.read().contains_key(dataset_id)
}

pub fn known_dataset_ids() -> Vec<String> {
    KNOWN_MANIFESTS.read().keys().cloned().collect()
}

pub fn reset_known_manifests() {
    KNOWN_MANIFESTS.write().clear();
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const MINIMAL: &str = r#"{
        "name": "C-GAP-17",
        "year": 2017,
        "description": "Amorphous carbon",
        "category": "Potential Fitting",
        "license": "CC BY-NC-SA 4.0",
        "citation": "@article{deringer2017, title={Carbon}}",
        "filename": "C-GAP-17.extxyz",
        "hash": "8dd037b59c88"
    }"#;

    #[test]
    fn shorthand_expands_to_single_file() {
        let manifest = DatasetManifest::parse(MINIMAL, "inline").unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.storage_format, StorageFormat::Memory);
        assert_eq!(manifest.license, Some(License::CcByNcSa4));

        let remote = manifest.remote_locations("https://host/db/");
        assert_eq!(remote[0].url, "https://host/db/C-GAP-17/C-GAP-17.extxyz");
        assert_eq!(remote[0].expected_hash.as_str(), "8dd037b59c88");
    }

    #[test]
    fn collects_every_problem() {
        let source = r#"{
            "name": "",
            "year": 2020,
            "description": "x",
            "category": "Toys",
            "license": "WTFPL",
            "citation": "not bibtex",
            "files": [{"name": "a.txt", "hash": "xyz"}]
        }"#;
        let err = DatasetManifest::parse(source, "bad.json").unwrap_err();
        let AtomsError::InvalidManifest { location, problems } = err else {
            panic!("expected InvalidManifest");
        };
        assert_eq!(location, "bad.json");
        assert_eq!(problems.len(), 5);
        assert!(problems[0].starts_with("name"));
        assert!(problems[1].starts_with("category"));
        assert!(problems[2].starts_with("license"));
        assert!(problems[3].starts_with("citation"));
        assert!(problems[4].starts_with("files[0].hash"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let source = MINIMAL.replace("\"year\"", "\"surprise\": 1, \"year\"");
        let err = DatasetManifest::parse(&source, "inline").unwrap_err();
        assert_matches!(err, AtomsError::ManifestParse { .. });
    }

    #[test]
    fn version_gate() {
        let source =
            MINIMAL.replace("\"year\"", "\"minimum_required_version\": \"99.0\", \"year\"");
        let manifest = DatasetManifest::parse(&source, "inline").unwrap();
        let err = manifest
            .check_version(&semver::Version::new(0, 3, 0))
            .unwrap_err();
        assert_matches!(err, AtomsError::UnsupportedVersion { .. });
        assert!(
            manifest
                .check_version(&semver::Version::new(99, 0, 0))
                .is_ok()
        );
    }

    #[test]
    fn legacy_version_key_is_accepted() {
        let source = MINIMAL.replace(
            "\"year\"",
            "\"format\": \"lmdb\", \"minimum_load_atoms_version\": 0.4, \"year\"",
        );
        let manifest = DatasetManifest::parse(&source, "inline").unwrap();
        assert_eq!(manifest.storage_format, StorageFormat::Paged);
        assert_eq!(
            manifest.minimum_required_version,
            Some(semver::Version::new(0, 4, 0))
        );
    }

    #[test]
    fn dataset_ids_stay_inside_the_cache() {
        assert!(is_valid_dataset_id("C-GAP-17"));
        assert!(is_valid_dataset_id("QM7"));
        assert!(!is_valid_dataset_id("../escape"));
        assert!(!is_valid_dataset_id(".."));
        assert!(!is_valid_dataset_id("a/b"));
        assert!(!is_valid_dataset_id("/etc"));
        assert!(!is_valid_dataset_id(""));
    }

    #[test]
    fn round_trips_through_json() {
        let manifest = DatasetManifest::parse(MINIMAL, "inline").unwrap();
        let json = manifest.to_json().unwrap();
        let reparsed = DatasetManifest::parse(&json, "round-trip").unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn importer_names_are_normalised() {
        assert_eq!(importer_name("C-GAP-17"), "c_gap_17");
        assert_eq!(
            manifest_url("https://host/db/", "QM7"),
            "https://host/db/QM7/QM7.json"
        );
        assert_eq!(url_basename("https://host/a/b/file.zip?download=1"), "file.zip");
    }
}
