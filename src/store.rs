use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::error::AtomsError;
use crate::manifest::StorageFormat;

/// On-disk layout of the dataset cache:
///
/// ```text
/// <root>/<id>/<id>.json               manifest
/// <root>/<id>/<id>.structures.json    in-memory artifact
/// <root>/<id>/<id>.paged/             paged artifact
/// <root>/raw-downloads/<scratch>/     in-flight raw files
/// ```
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dataset_dir(&self, id: &str) -> Utf8PathBuf {
        self.root.join(id)
    }

    pub fn manifest_path(&self, id: &str) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("{id}.json"))
    }

    pub fn memory_artifact_path(&self, id: &str) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("{id}.structures.json"))
    }

    pub fn paged_artifact_path(&self, id: &str) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("{id}.paged"))
    }

    pub fn artifact_path(&self, id: &str, format: StorageFormat) -> Utf8PathBuf {
        match format {
            StorageFormat::Memory => self.memory_artifact_path(id),
            StorageFormat::Paged => self.paged_artifact_path(id),
        }
    }

    pub fn scratch_root(&self) -> Utf8PathBuf {
        self.root.join("raw-downloads")
    }

    pub fn scratch_dir(&self, name: &str) -> Utf8PathBuf {
        self.scratch_root().join(name)
    }

    pub fn ensure_root(&self) -> Result<(), AtomsError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| AtomsError::Filesystem(err.to_string()))
    }

    pub fn has_artifact(&self, id: &str, format: StorageFormat) -> bool {
        self.artifact_path(id, format).as_std_path().exists()
    }

    pub fn remove_artifact(&self, id: &str, format: StorageFormat) -> Result<(), AtomsError> {
        let path = self.artifact_path(id, format);
        remove_path(path.as_std_path())
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), AtomsError> {
    let temp = temp_file_beside(path)?;
    fs::write(temp.path(), content).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Serializes `value` into a sibling temp file and moves it into place.
/// Returns `false`, discarding the new copy, when `path` was written by
/// someone else in the meantime.
pub fn write_json_noclobber<T: Serialize>(path: &Utf8Path, value: &T) -> Result<bool, AtomsError> {
    let mut temp = temp_file_beside(path)?;
    {
        let mut writer = io::BufWriter::new(temp.as_file_mut());
        serde_json::to_writer(&mut writer, value)
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    }
    match temp.persist_noclobber(path.as_std_path()) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(AtomsError::Filesystem(err.to_string())),
    }
}

fn temp_file_beside(path: &Utf8Path) -> Result<tempfile::NamedTempFile, AtomsError> {
    let parent = path
        .parent()
        .ok_or_else(|| AtomsError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Builder::new()
        .prefix(".load-atoms-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| AtomsError::Filesystem(err.to_string()))
}

/// A temporary directory next to `path`, on the same filesystem so it can be
/// renamed into place.
pub fn temp_dir_beside(path: &Utf8Path) -> Result<tempfile::TempDir, AtomsError> {
    let parent = path
        .parent()
        .ok_or_else(|| AtomsError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Builder::new()
        .prefix(".load-atoms-dir")
        .tempdir_in(parent.as_std_path())
        .map_err(|err| AtomsError::Filesystem(err.to_string()))
}

/// Moves a finished directory into place. The first writer wins: if `to`
/// already exists, `from` is removed and `false` returned.
pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<bool> {
    if to.exists() {
        fs::remove_dir_all(from)?;
        return Ok(false);
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(_) if to.exists() => {
            fs::remove_dir_all(from)?;
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

pub fn remove_path(path: &Path) -> Result<(), AtomsError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    };
    result.map_err(|err| AtomsError::Filesystem(format!("remove {}: {err}", path.display())))
}

pub(crate) fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, AtomsError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| AtomsError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

pub fn utf8_path(path: &Path) -> Result<Utf8PathBuf, AtomsError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|path| AtomsError::Filesystem(format!("non-utf8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = CacheLayout::new("/cache");
        assert_eq!(layout.manifest_path("QM7"), Utf8PathBuf::from("/cache/QM7/QM7.json"));
        assert!(
            layout
                .artifact_path("QM7", StorageFormat::Paged)
                .ends_with("QM7/QM7.paged")
        );
        assert!(
            layout
                .artifact_path("QM7", StorageFormat::Memory)
                .ends_with("QM7/QM7.structures.json")
        );
        assert_eq!(
            layout.scratch_dir("shared"),
            Utf8PathBuf::from("/cache/raw-downloads/shared")
        );
    }

    #[test]
    fn first_writer_wins() {
        let temp = tempfile::tempdir().unwrap();
        let path = utf8_path(&temp.path().join("out.json")).unwrap();
        assert!(write_json_noclobber(&path, &vec![1, 2, 3]).unwrap());
        assert!(!write_json_noclobber(&path, &vec![4]).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1,2,3]");

        let target = temp.path().join("dir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        assert!(atomic_rename_dir(&first, &target).unwrap());
        assert!(!atomic_rename_dir(&second, &target).unwrap());
        assert!(!second.exists());
    }
}
