use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use super::lazy::{LazyColumns, LazyValue};
use super::{AtomsDataset, Dataset, count_species, intersect_keys};
use crate::error::AtomsError;
use crate::manifest::DatasetManifest;
use crate::store::write_json_noclobber;
use crate::structure::{AtomArray, InfoValue, Structure};

#[derive(Serialize)]
struct ArtifactRef<'a> {
    manifest: Option<&'a DatasetManifest>,
    structures: &'a [Structure],
}

#[derive(Deserialize)]
struct Artifact {
    manifest: Option<DatasetManifest>,
    structures: Vec<Structure>,
}

/// Every structure held in memory. Views made by selection share the
/// underlying storage and keep their own lazily computed columns.
pub struct InMemoryDataset {
    structures: Arc<Vec<Structure>>,
    view: Option<Arc<[usize]>>,
    manifest: Option<Arc<DatasetManifest>>,
    info_columns: LazyColumns<Vec<InfoValue>>,
    array_columns: LazyColumns<AtomArray>,
    species: LazyValue<BTreeMap<String, usize>>,
}

impl InMemoryDataset {
    pub fn new(structures: Vec<Structure>, manifest: Option<Arc<DatasetManifest>>) -> Self {
        if structures.len() == 1 {
            tracing::warn!(
                "creating a dataset with a single structure; \
                 to build a dataset from many structures, pass them all at once"
            );
        }
        Self::view_of(Arc::new(structures), None, manifest)
    }

    fn view_of(
        structures: Arc<Vec<Structure>>,
        view: Option<Arc<[usize]>>,
        manifest: Option<Arc<DatasetManifest>>,
    ) -> Self {
        Self {
            structures,
            view,
            manifest,
            info_columns: LazyColumns::new(),
            array_columns: LazyColumns::new(),
            species: LazyValue::new(),
        }
    }

    /// Writes `{ manifest, structures }` to `path` as a single JSON document.
    /// Returns `false` when another writer created `path` first.
    pub fn save(
        path: &Utf8Path,
        structures: &[Structure],
        manifest: Option<&DatasetManifest>,
    ) -> Result<bool, AtomsError> {
        write_json_noclobber(
            path,
            &ArtifactRef {
                manifest,
                structures,
            },
        )
    }

    pub fn load(path: &Path) -> Result<Self, AtomsError> {
        if !path.exists() {
            return Err(AtomsError::MissingPath(path.display().to_string()));
        }
        let file = fs::File::open(path)
            .map_err(|err| AtomsError::Filesystem(format!("open {}: {err}", path.display())))?;
        let artifact: Artifact = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| AtomsError::Storage(format!("{}: {err}", path.display())))?;
        for structure in &artifact.structures {
            structure.validate()?;
        }
        Ok(Self::new(
            artifact.structures,
            artifact.manifest.map(Arc::new),
        ))
    }

    fn position(&self, index: usize) -> Option<usize> {
        match &self.view {
            Some(view) => view.get(index).copied(),
            None => (index < self.structures.len()).then_some(index),
        }
    }

    fn members(&self) -> impl Iterator<Item = &Structure> + '_ {
        (0..self.len()).filter_map(|index| {
            self.position(index)
                .and_then(|position| self.structures.get(position))
        })
    }
}

impl Clone for InMemoryDataset {
    fn clone(&self) -> Self {
        Self::view_of(
            self.structures.clone(),
            self.view.clone(),
            self.manifest.clone(),
        )
    }
}

impl AtomsDataset for InMemoryDataset {
    fn len(&self) -> usize {
        match &self.view {
            Some(view) => view.len(),
            None => self.structures.len(),
        }
    }

    fn get(&self, index: usize) -> Result<Cow<'_, Structure>, AtomsError> {
        self.position(index)
            .and_then(|position| self.structures.get(position))
            .map(Cow::Borrowed)
            .ok_or(AtomsError::IndexOutOfRange {
                index: index as isize,
                len: self.len(),
            })
    }

    fn select_indices(&self, indices: &[usize]) -> Result<Dataset, AtomsError> {
        let positions = indices
            .iter()
            .map(|index| {
                self.position(*index).ok_or(AtomsError::IndexOutOfRange {
                    index: *index as isize,
                    len: self.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dataset::Memory(Self::view_of(
            self.structures.clone(),
            Some(positions.into()),
            self.manifest.clone(),
        )))
    }

    fn structure_sizes(&self) -> Vec<usize> {
        self.members().map(Structure::len).collect()
    }

    fn info_keys(&self) -> Result<Vec<String>, AtomsError> {
        Ok(intersect_keys(
            self.members().map(|structure| structure.info().keys()),
        ))
    }

    fn array_keys(&self) -> Result<Vec<String>, AtomsError> {
        Ok(intersect_keys(
            self.members().map(|structure| structure.arrays().keys()),
        ))
    }

    fn info(&self, key: &str) -> Result<Option<Arc<Vec<InfoValue>>>, AtomsError> {
        self.info_columns.get_or_compute(key, || {
            if self.is_empty() {
                return Ok(None);
            }
            Ok(self
                .members()
                .map(|structure| structure.info_value(key).cloned())
                .collect::<Option<Vec<_>>>())
        })
    }

    fn arrays(&self, key: &str) -> Result<Option<Arc<AtomArray>>, AtomsError> {
        self.array_columns.get_or_compute(key, || {
            if self.is_empty() {
                return Ok(None);
            }
            let Some(parts) = self
                .members()
                .map(|structure| structure.array(key))
                .collect::<Option<Vec<_>>>()
            else {
                return Ok(None);
            };
            AtomArray::concat(parts).map(Some)
        })
    }

    fn species_counts(&self) -> Result<Arc<BTreeMap<String, usize>>, AtomsError> {
        self.species
            .get_or_compute(|| Ok(count_species(self.members())))
    }

    fn manifest(&self) -> Option<&Arc<DatasetManifest>> {
        self.manifest.as_ref()
    }
}
