//! Resolves a dataset id to a ready [`Dataset`]: manifest, cache lookup,
//! download, verification, import and persistence.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8Path;

use crate::checksum;
use crate::config::Settings;
use crate::dataset::{Dataset, InMemoryDataset, PagedDataset};
use crate::download::{Download, DownloadClient, fetch, fetch_all};
use crate::error::AtomsError;
use crate::importer::{Importer, ImporterRegistry};
use crate::io::{JsonLinesIo, StructureIo};
use crate::manifest::{
    DatasetManifest, License, StorageFormat, frontend_url, is_valid_dataset_id, known_manifest,
    manifest_url,
};
use crate::progress::{Phase, ProgressEvent, ProgressSink, SilentProgress, TerminalProgress};
use crate::store::{CacheLayout, remove_path, write_bytes_atomic};
use crate::structure::Structure;

/// License terms, citation request and further-information pointer shown
/// once per load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageNotice {
    pub dataset: String,
    pub license: Option<License>,
    pub citation_requested: bool,
    pub info_url: String,
}

impl UsageNotice {
    pub fn for_manifest(manifest: &DatasetManifest) -> Self {
        Self {
            dataset: manifest.name.clone(),
            license: manifest.license,
            citation_requested: manifest.citation.is_some(),
            info_url: frontend_url(&manifest.name),
        }
    }
}

impl fmt::Display for UsageNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = &self.dataset;
        if let Some(license) = self.license {
            writeln!(
                f,
                "The {name} dataset is covered by the {license} license ({}).",
                license.url()
            )?;
        }
        if self.citation_requested {
            writeln!(f, "Please cite the {name} dataset if you use it in your work.")?;
        }
        writeln!(f, "For more information about the {name} dataset, visit:")?;
        write!(f, "{}", self.info_url)
    }
}

#[derive(Debug)]
pub struct LoadedDataset {
    pub dataset: Dataset,
    pub manifest: Arc<DatasetManifest>,
    pub notice: UsageNotice,
    /// One entry per downloaded file whose content did not match its
    /// declared hash. Always empty on a cache hit.
    pub checksum_warnings: Vec<String>,
}

pub struct Backend<C: DownloadClient> {
    settings: Settings,
    client: C,
    layout: CacheLayout,
    registry: ImporterRegistry,
    io: Arc<dyn StructureIo>,
    sink: Arc<dyn ProgressSink>,
}

impl<C: DownloadClient> Backend<C> {
    pub fn new(settings: Settings, client: C) -> Self {
        let sink: Arc<dyn ProgressSink> = if settings.verbose {
            Arc::new(TerminalProgress::new())
        } else {
            Arc::new(SilentProgress)
        };
        Self {
            layout: CacheLayout::new(settings.root.clone()),
            settings,
            client,
            registry: ImporterRegistry::empty(),
            io: Arc::new(JsonLinesIo),
            sink,
        }
    }

    pub fn with_registry(mut self, registry: ImporterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_io(mut self, io: Arc<dyn StructureIo>) -> Self {
        self.io = io;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn load(&self, dataset_id: &str) -> Result<LoadedDataset, AtomsError> {
        if !is_valid_dataset_id(dataset_id) {
            return Err(AtomsError::InvalidDatasetId {
                id: dataset_id.to_string(),
            });
        }
        self.layout.ensure_root()?;

        self.phase(dataset_id, Phase::NeedManifest);
        let manifest = Arc::new(self.resolve_manifest(dataset_id)?);
        let current = semver::Version::parse(env!("CARGO_PKG_VERSION"))
            .map_err(|err| AtomsError::Config(err.to_string()))?;
        manifest.check_version(&current)?;
        self.phase(dataset_id, Phase::HaveManifest);

        let format = manifest.storage_format;
        let artifact = self.layout.artifact_path(dataset_id, format);
        let mut checksum_warnings = Vec::new();
        let dataset = if artifact.as_std_path().exists() {
            self.phase(dataset_id, Phase::CacheHit);
            tracing::info!(dataset = dataset_id, path = %artifact, "reading cached dataset");
            open_artifact(&artifact, format)?
        } else {
            self.phase(dataset_id, Phase::NeedImport);
            let importer = self
                .registry
                .resolve(&manifest, &self.settings.base_remote_url)?;
            let scratch = self.layout.scratch_dir(importer.scratch_dir_name());
            let outcome =
                self.import(dataset_id, &manifest, importer.as_ref(), &scratch, &artifact);
            self.cleanup_scratch(importer.as_ref(), &scratch);
            checksum_warnings = outcome?;
            open_artifact(&artifact, format)?
        };
        self.phase(dataset_id, Phase::Ready);

        let notice = UsageNotice::for_manifest(&manifest);
        self.sink.event(ProgressEvent::Notice(notice.to_string()));
        Ok(LoadedDataset {
            dataset,
            manifest,
            notice,
            checksum_warnings,
        })
    }

    fn phase(&self, dataset_id: &str, phase: Phase) {
        tracing::info!(dataset = dataset_id, %phase, "load phase");
        self.sink.event(ProgressEvent::Phase {
            dataset: dataset_id.to_string(),
            phase,
        });
    }

    /// Local copy first, then the process-wide registry, then the remote
    /// well-known location. A remote 4xx means the id is unknown.
    fn resolve_manifest(&self, dataset_id: &str) -> Result<DatasetManifest, AtomsError> {
        let local = self.layout.manifest_path(dataset_id);
        if !local.as_std_path().exists() {
            if let Some(known) = known_manifest(dataset_id) {
                write_bytes_atomic(&local, known.to_json()?.as_bytes())?;
            } else {
                self.download_manifest(dataset_id, &local)?;
            }
        }
        let manifest = DatasetManifest::from_file(local.as_std_path())?;
        if manifest.name != dataset_id {
            return Err(AtomsError::InvalidManifest {
                location: local.to_string(),
                problems: vec![format!(
                    "name: {:?} does not match the requested dataset id {dataset_id:?}",
                    manifest.name
                )],
            });
        }
        Ok(manifest)
    }

    fn download_manifest(&self, dataset_id: &str, local: &Utf8Path) -> Result<(), AtomsError> {
        if self.settings.base_remote_url.trim().is_empty() {
            return Err(AtomsError::NoRemoteDatabase {
                id: dataset_id.to_string(),
            });
        }
        let url = manifest_url(&self.settings.base_remote_url, dataset_id);
        tracing::debug!(dataset = dataset_id, %url, "fetching manifest");
        match fetch(&self.client, &url, local.as_std_path(), self.sink.as_ref()) {
            Ok(_) => Ok(()),
            Err(AtomsError::HttpStatus { status, .. }) if (400..500).contains(&status) => {
                Err(AtomsError::UnknownDataset {
                    id: dataset_id.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn import(
        &self,
        dataset_id: &str,
        manifest: &DatasetManifest,
        importer: &dyn Importer,
        scratch: &Utf8Path,
        artifact: &Utf8Path,
    ) -> Result<Vec<String>, AtomsError> {
        let files = importer.files_to_download();
        let missing: Vec<Download> = files
            .iter()
            .map(|file| {
                Download::new(file.url.clone(), scratch.as_std_path().join(&file.local_name))
            })
            .filter(|download| !download.destination.exists())
            .collect();
        tracing::info!(
            dataset = dataset_id,
            needed = files.len(),
            missing = missing.len(),
            "downloading raw files"
        );
        fetch_all(
            &self.client,
            &missing,
            self.settings.download_workers,
            self.sink.as_ref(),
        )?;

        let mut warnings = Vec::new();
        for file in &files {
            let path = scratch.as_std_path().join(&file.local_name);
            let actual = checksum::digest(&path)?;
            if actual == file.expected_hash {
                continue;
            }
            if self.settings.strict_checksums {
                return Err(AtomsError::ChecksumMismatch {
                    dataset: dataset_id.to_string(),
                    file: file.local_name.clone(),
                    expected: file.expected_hash.to_string(),
                    actual: actual.to_string(),
                });
            }
            let warning = format!(
                "checksum mismatch for {} in dataset {dataset_id}: expected {}, got {actual}",
                file.local_name, file.expected_hash
            );
            tracing::warn!("{warning}");
            self.sink.event(ProgressEvent::Warning(warning.clone()));
            warnings.push(warning);
        }

        self.persist(dataset_id, manifest, importer, scratch.as_std_path(), artifact)
            .map_err(|err| match err {
                AtomsError::ImportFailed { .. } => err,
                other => AtomsError::ImportFailed {
                    dataset: dataset_id.to_string(),
                    message: other.to_string(),
                },
            })?;
        Ok(warnings)
    }

    /// Streams the importer's output into the cache artifact. Both artifact
    /// kinds are built beside their final path and moved into place whole, so
    /// a failure part-way never leaves a readable artifact behind.
    fn persist(
        &self,
        dataset_id: &str,
        manifest: &DatasetManifest,
        importer: &dyn Importer,
        scratch: &Path,
        artifact: &Utf8Path,
    ) -> Result<(), AtomsError> {
        let structures = importer
            .get_structures(scratch, self.io.as_ref())?
            .map(|structure| structure.map(without_calculator));
        let written = match manifest.storage_format {
            StorageFormat::Memory => {
                let structures = structures.collect::<Result<Vec<_>, _>>()?;
                InMemoryDataset::save(artifact, &structures, Some(manifest))?
            }
            StorageFormat::Paged => PagedDataset::save(artifact, structures, Some(manifest))?,
        };
        if !written {
            tracing::info!(
                dataset = dataset_id,
                path = %artifact,
                "another writer cached this dataset first; using its copy"
            );
        }
        Ok(())
    }

    fn cleanup_scratch(&self, importer: &dyn Importer, scratch: &Utf8Path) {
        if self.settings.keep_scratch() || !importer.cleanup() {
            return;
        }
        if scratch == self.layout.scratch_root().as_path() {
            return;
        }
        if let Err(err) = remove_path(scratch.as_std_path()) {
            tracing::warn!(path = %scratch, error = %err, "failed to clean up raw downloads");
        }
    }
}

fn without_calculator(mut structure: Structure) -> Structure {
    structure.strip_calculator();
    structure
}

fn open_artifact(path: &Utf8Path, format: StorageFormat) -> Result<Dataset, AtomsError> {
    match format {
        StorageFormat::Memory => Ok(Dataset::Memory(InMemoryDataset::load(path.as_std_path())?)),
        StorageFormat::Paged => Ok(Dataset::Paged(PagedDataset::open(path.as_std_path())?)),
    }
}
