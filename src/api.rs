use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::Settings;
use crate::dataset::{Dataset, InMemoryDataset};
use crate::download::HttpDownloadClient;
use crate::error::AtomsError;
use crate::io::{JsonLinesIo, StructureIo};
use crate::store::utf8_path;
use crate::structure::Structure;

/// What [`load_dataset`] should turn into a [`Dataset`].
#[derive(Debug, Clone)]
pub enum DatasetSource {
    Structures(Vec<Structure>),
    Path(PathBuf),
    /// A dataset id, or a path that may not exist yet.
    Named(String),
}

impl From<Vec<Structure>> for DatasetSource {
    fn from(structures: Vec<Structure>) -> Self {
        DatasetSource::Structures(structures)
    }
}

impl From<&str> for DatasetSource {
    fn from(name: &str) -> Self {
        DatasetSource::Named(name.to_string())
    }
}

impl From<String> for DatasetSource {
    fn from(name: String) -> Self {
        DatasetSource::Named(name)
    }
}

impl From<PathBuf> for DatasetSource {
    fn from(path: PathBuf) -> Self {
        DatasetSource::Path(path)
    }
}

impl From<&Path> for DatasetSource {
    fn from(path: &Path) -> Self {
        DatasetSource::Path(path.to_path_buf())
    }
}

/// Loads a dataset with settings from the environment, caching below `root`
/// when given.
pub fn load_dataset(
    source: impl Into<DatasetSource>,
    root: Option<&Path>,
) -> Result<Dataset, AtomsError> {
    let mut settings = Settings::from_env()?;
    if let Some(root) = root {
        settings.root = utf8_path(root)?;
    }
    load_dataset_with(settings, source)
}

pub fn load_dataset_with(
    settings: Settings,
    source: impl Into<DatasetSource>,
) -> Result<Dataset, AtomsError> {
    load_dataset_with_io(settings, source, Arc::new(JsonLinesIo))
}

/// Like [`load_dataset_with`], reading structure files (local paths and
/// downloaded raw files alike) with `io`.
pub fn load_dataset_with_io(
    settings: Settings,
    source: impl Into<DatasetSource>,
    io: Arc<dyn StructureIo>,
) -> Result<Dataset, AtomsError> {
    match source.into() {
        DatasetSource::Structures(structures) => Ok(Dataset::from_structures(structures)),
        DatasetSource::Path(path) => {
            if !path.exists() {
                return Err(AtomsError::MissingPath(path.display().to_string()));
            }
            read_path(&path, io.as_ref())
        }
        DatasetSource::Named(name) => {
            let path = Path::new(&name);
            if path.exists() {
                return read_path(path, io.as_ref());
            }
            let backend = Backend::new(settings, HttpDownloadClient::new()?).with_io(io);
            Ok(backend.load(&name)?.dataset)
        }
    }
}

/// Saved artifacts open directly; anything else is read with `io`.
pub fn read_path(path: &Path, io: &dyn StructureIo) -> Result<Dataset, AtomsError> {
    let is_artifact = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".structures.json"));
    if path.is_dir() || is_artifact {
        return Dataset::load(path);
    }
    Ok(Dataset::Memory(InMemoryDataset::new(io.read(path)?, None)))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::dataset::AtomsDataset;

    #[test]
    fn structures_wrap_directly() {
        let settings = Settings::with_root("/nonexistent");
        let structures = vec![
            Structure::from_symbols(&["H"], &[[0.0; 3]]).unwrap(),
            Structure::from_symbols(&["He"], &[[0.0; 3]]).unwrap(),
        ];
        let dataset = load_dataset_with(settings, structures).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let settings = Settings::with_root("/nonexistent");
        let err =
            load_dataset_with(settings, Path::new("/definitely/not/here.jsonl")).unwrap_err();
        assert_matches!(err, AtomsError::MissingPath(_));
        assert!(err.to_string().contains("does not exist"));
    }

    struct CountingIo {
        reads: parking_lot::Mutex<usize>,
    }

    impl StructureIo for CountingIo {
        fn read(&self, path: &Path) -> Result<Vec<Structure>, AtomsError> {
            *self.reads.lock() += 1;
            JsonLinesIo.read(path)
        }

        fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), AtomsError> {
            JsonLinesIo.write(path, structures)
        }
    }

    #[test]
    fn caller_supplied_io_reads_paths() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("single.jsonl");
        let structures = vec![Structure::from_symbols(&["He"], &[[0.0; 3]]).unwrap()];
        JsonLinesIo.write(&path, &structures).unwrap();

        let io = Arc::new(CountingIo {
            reads: parking_lot::Mutex::new(0),
        });
        let settings = Settings::with_root("/nonexistent");
        let dataset = load_dataset_with_io(settings, path.as_path(), io.clone()).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(*io.reads.lock(), 1);
    }

    #[test]
    fn invalid_ids_are_rejected_before_any_request() {
        let temp = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(
            camino::Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap(),
        );
        let err = load_dataset_with(settings, "../escape").unwrap_err();
        assert_matches!(err, AtomsError::InvalidDatasetId { .. });
        assert!(!temp.path().join("escape").exists());
    }

    #[test]
    fn existing_file_is_read_with_structure_io() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pair.jsonl");
        let structures = vec![
            Structure::from_symbols(&["H"], &[[0.0; 3]]).unwrap(),
            Structure::from_symbols(&["O"], &[[0.0; 3]]).unwrap(),
        ];
        JsonLinesIo.write(&path, &structures).unwrap();

        let settings = Settings::with_root(
            camino::Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap(),
        );
        let dataset = load_dataset_with(settings, path.to_str().unwrap()).unwrap();
        assert_eq!(dataset.to_vec().unwrap(), structures);
    }
}
