//! Per-dataset import pipelines: which raw files a dataset needs, and how to
//! turn them into structures once they are downloaded and verified.

use std::collections::{BTreeMap, HashMap};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AtomsError;
use crate::fs_util::{ArchiveKind, unpack_archive};
use crate::io::StructureIo;
use crate::manifest::{DatasetManifest, RemoteFile, importer_name};
use crate::store::walk_dir;
use crate::structure::{AtomArray, InfoValue, Structure};

pub type StructureStream<'a> = Box<dyn Iterator<Item = Result<Structure, AtomsError>> + 'a>;
pub type PostProcess = Arc<dyn Fn(Structure) -> Result<Structure, AtomsError> + Send + Sync>;

pub trait Importer: Send + Sync {
    fn files_to_download(&self) -> Vec<RemoteFile>;

    /// Directory name under the shared raw-downloads area. Importers whose
    /// sources are shared between datasets use a stable name here.
    fn scratch_dir_name(&self) -> &str;

    fn cleanup(&self) -> bool {
        true
    }

    /// Single-pass stream over the imported structures. Every file from
    /// [`Importer::files_to_download`] is present in `dir` when this is called.
    fn get_structures<'a>(
        &'a self,
        dir: &'a Path,
        io: &'a dyn StructureIo,
    ) -> Result<StructureStream<'a>, AtomsError>;
}

/// Reads every record of one downloaded file.
pub struct SingleFileImporter {
    file: RemoteFile,
    post_process: Option<PostProcess>,
}

impl SingleFileImporter {
    pub fn new(file: RemoteFile) -> Self {
        Self {
            file,
            post_process: None,
        }
    }

    /// Reads the manifest's only declared file.
    pub fn from_manifest(manifest: &DatasetManifest, base_url: &str) -> Result<Self, AtomsError> {
        Ok(Self::new(sole_remote_file(manifest, base_url)?))
    }

    pub fn with_post_process<F>(mut self, post_process: F) -> Self
    where
        F: Fn(Structure) -> Result<Structure, AtomsError> + Send + Sync + 'static,
    {
        self.post_process = Some(Arc::new(post_process));
        self
    }
}

impl Importer for SingleFileImporter {
    fn files_to_download(&self) -> Vec<RemoteFile> {
        vec![self.file.clone()]
    }

    fn scratch_dir_name(&self) -> &str {
        "."
    }

    fn cleanup(&self) -> bool {
        false
    }

    fn get_structures<'a>(
        &'a self,
        dir: &'a Path,
        io: &'a dyn StructureIo,
    ) -> Result<StructureStream<'a>, AtomsError> {
        let path = dir.join(&self.file.local_name);
        tracing::info!(path = %path.display(), "reading structures");
        let structures = io.read(&path)?;
        Ok(post_processed(
            Box::new(structures.into_iter().map(Ok)),
            self.post_process.clone(),
        ))
    }
}

/// Downloads one archive, unpacks it, and reads the selected members.
pub struct ArchiveImporter {
    archive: RemoteFile,
    scratch: String,
    cleanup: bool,
    members: Vec<String>,
    extension: Option<String>,
    post_process: Option<PostProcess>,
}

impl ArchiveImporter {
    pub fn new(archive: RemoteFile, scratch: impl Into<String>) -> Self {
        Self {
            archive,
            scratch: scratch.into(),
            cleanup: true,
            members: Vec::new(),
            extension: None,
            post_process: None,
        }
    }

    /// Unpacks the manifest's only declared file into a scratch directory
    /// named after the dataset.
    pub fn from_manifest(manifest: &DatasetManifest, base_url: &str) -> Result<Self, AtomsError> {
        Ok(Self::new(sole_remote_file(manifest, base_url)?, manifest.name.clone()))
    }

    /// Read these paths, relative to the unpacked tree, in this order.
    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    /// Without explicit members, read every file with this extension in
    /// sorted path order.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn keep_downloads(mut self) -> Self {
        self.cleanup = false;
        self
    }

    pub fn with_post_process<F>(mut self, post_process: F) -> Self
    where
        F: Fn(Structure) -> Result<Structure, AtomsError> + Send + Sync + 'static,
    {
        self.post_process = Some(Arc::new(post_process));
        self
    }

    fn member_paths(&self, root: &Path) -> Result<Vec<PathBuf>, AtomsError> {
        if !self.members.is_empty() {
            return Ok(self.members.iter().map(|member| root.join(member)).collect());
        }
        let files = walk_dir(root)?
            .into_iter()
            .filter(|path| path.is_file())
            .filter(|path| match &self.extension {
                Some(extension) => path.extension().is_some_and(|ext| ext == extension.as_str()),
                None => true,
            })
            .collect();
        Ok(files)
    }
}

impl Importer for ArchiveImporter {
    fn files_to_download(&self) -> Vec<RemoteFile> {
        vec![self.archive.clone()]
    }

    fn scratch_dir_name(&self) -> &str {
        &self.scratch
    }

    fn cleanup(&self) -> bool {
        self.cleanup
    }

    fn get_structures<'a>(
        &'a self,
        dir: &'a Path,
        io: &'a dyn StructureIo,
    ) -> Result<StructureStream<'a>, AtomsError> {
        let root = unpack_archive(&dir.join(&self.archive.local_name))?;
        let paths = self.member_paths(&root)?;
        Ok(post_processed(read_each(paths, io), self.post_process.clone()))
    }
}

/// Fallback importer: reads every file the manifest declares, unpacking
/// archives on the way.
pub struct ManifestImporter {
    files: Vec<RemoteFile>,
    scratch: String,
    renames: BTreeMap<String, String>,
}

impl ManifestImporter {
    pub fn new(manifest: &DatasetManifest, base_url: &str) -> Self {
        Self {
            files: manifest.remote_locations(base_url),
            scratch: manifest.name.clone(),
            renames: BTreeMap::new(),
        }
    }

    pub fn with_renames<I, K, V>(mut self, renames: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.renames = renames
            .into_iter()
            .map(|(old, new)| (old.into(), new.into()))
            .collect();
        self
    }
}

impl Importer for ManifestImporter {
    fn files_to_download(&self) -> Vec<RemoteFile> {
        self.files.clone()
    }

    fn scratch_dir_name(&self) -> &str {
        &self.scratch
    }

    fn get_structures<'a>(
        &'a self,
        dir: &'a Path,
        io: &'a dyn StructureIo,
    ) -> Result<StructureStream<'a>, AtomsError> {
        let mut paths = Vec::new();
        for file in &self.files {
            let path = dir.join(&file.local_name);
            if ArchiveKind::detect(&path).is_some() {
                let root = unpack_archive(&path)?;
                paths.extend(walk_dir(&root)?.into_iter().filter(|entry| entry.is_file()));
            } else {
                paths.push(path);
            }
        }
        let stream = read_each(paths, io);
        if self.renames.is_empty() {
            return Ok(stream);
        }
        Ok(Box::new(stream.map(move |structure| {
            structure.and_then(|structure| rename(structure, &self.renames))
        })))
    }
}

fn read_each<'a>(paths: Vec<PathBuf>, io: &'a dyn StructureIo) -> StructureStream<'a> {
    Box::new(paths.into_iter().flat_map(move |path| {
        tracing::debug!(path = %path.display(), "reading structures");
        let records: StructureStream<'a> = match io.read(&path) {
            Ok(structures) => Box::new(structures.into_iter().map(Ok)),
            Err(err) => Box::new(iter::once(Err(err))),
        };
        records
    }))
}

fn post_processed<'a>(
    stream: StructureStream<'a>,
    post: Option<PostProcess>,
) -> StructureStream<'a> {
    match post {
        Some(post) => Box::new(stream.map(move |structure| structure.and_then(|s| post(s)))),
        None => stream,
    }
}

/// Moves each `old` property (per-atom first, then per-structure) to `new`.
pub fn rename(
    mut structure: Structure,
    mapping: &BTreeMap<String, String>,
) -> Result<Structure, AtomsError> {
    for (old, new) in mapping {
        if structure.array(old).is_some() {
            if let Some(array) = structure.remove_array(old)? {
                structure.set_array(new.clone(), array)?;
            }
        } else if let Some(value) = structure.remove_info(old)? {
            structure.set_info(new.clone(), value)?;
        }
    }
    Ok(structure)
}

/// Scales a floating-point property in place. Missing keys are left alone.
pub fn convert_units(
    mut structure: Structure,
    key: &str,
    factor: f64,
) -> Result<Structure, AtomsError> {
    if let Some(array) = structure.array(key).cloned() {
        let scaled = match array {
            AtomArray::Float { values, width } => AtomArray::Float {
                values: values.into_iter().map(|value| value * factor).collect(),
                width,
            },
            other => {
                return Err(AtomsError::InvalidStructure(format!(
                    "cannot convert units of non-float array {key} (width {})",
                    other.width()
                )));
            }
        };
        structure.set_array(key, scaled)?;
    } else if let Some(value) = structure.info_value(key).cloned() {
        let scaled = match value {
            InfoValue::Float(value) => InfoValue::Float(value * factor),
            InfoValue::Int(value) => InfoValue::Float(value as f64 * factor),
            InfoValue::FloatVec(values) => {
                InfoValue::FloatVec(values.into_iter().map(|value| value * factor).collect())
            }
            _ => {
                return Err(AtomsError::InvalidStructure(format!(
                    "cannot convert units of non-numeric property {key}"
                )));
            }
        };
        structure.set_info(key, scaled)?;
    }
    Ok(structure)
}

pub type ImporterFactory =
    Arc<dyn Fn(&DatasetManifest, &str) -> Result<Box<dyn Importer>, AtomsError> + Send + Sync>;

/// Importers keyed by [`importer_name`]. Datasets without a dedicated
/// importer are read through [`ManifestImporter`].
#[derive(Clone, Default)]
pub struct ImporterRegistry {
    factories: HashMap<String, ImporterFactory>,
}

impl ImporterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, dataset_id: &str, factory: F)
    where
        F: Fn(&DatasetManifest, &str) -> Result<Box<dyn Importer>, AtomsError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(importer_name(dataset_id), Arc::new(factory));
    }

    pub fn contains(&self, dataset_id: &str) -> bool {
        self.factories.contains_key(&importer_name(dataset_id))
    }

    pub fn resolve(
        &self,
        manifest: &DatasetManifest,
        base_url: &str,
    ) -> Result<Box<dyn Importer>, AtomsError> {
        let base = base_url.trim_end_matches('/');
        match self.factories.get(&importer_name(&manifest.name)) {
            Some(factory) => factory(manifest, base),
            None => Ok(Box::new(ManifestImporter::new(manifest, base))),
        }
    }
}

/// The one file a single-file or archive importer reads, as declared (url
/// and checksum) by the manifest.
fn sole_remote_file(manifest: &DatasetManifest, base_url: &str) -> Result<RemoteFile, AtomsError> {
    let mut files = manifest.remote_locations(base_url);
    if files.len() != 1 {
        return Err(AtomsError::InvalidManifest {
            location: manifest.name.clone(),
            problems: vec![format!(
                "files: this dataset's importer reads exactly one file, the manifest declares {}",
                files.len()
            )],
        });
    }
    Ok(files.remove(0))
}
