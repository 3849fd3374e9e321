use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bincode::config::standard;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::lazy::{LazyColumns, LazyValue};
use super::{AtomsDataset, Dataset, intersect_keys};
use crate::error::AtomsError;
use crate::manifest::DatasetManifest;
use crate::store::{atomic_rename_dir, temp_dir_beside};
use crate::structure::{AtomArray, InfoValue, Structure};

const METADATA_KEY: &str = "metadata";
const MANIFEST_KEY: &str = "manifest";

static OPEN_STORES: Mutex<BTreeMap<PathBuf, Weak<PagedStore>>> =
    parking_lot::const_mutex(BTreeMap::new());

fn structure_key(index: usize) -> String {
    format!("structure/{index:010}")
}

fn storage_error(err: impl ToString) -> AtomsError {
    AtomsError::Storage(err.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct KeySet {
    info: Vec<String>,
    arrays: Vec<String>,
}

/// Written once after every structure; lets a full view answer size, key and
/// species queries without decoding structures.
#[derive(Debug, Serialize, Deserialize)]
struct PagedMetadata {
    structure_sizes: Vec<usize>,
    key_sets: Vec<KeySet>,
    record_key_sets: Vec<u32>,
    species_counts: BTreeMap<String, usize>,
    imported_at: String,
}

struct PagedStore {
    path: PathBuf,
    db: sled::Db,
    metadata: PagedMetadata,
    manifest: Option<Arc<DatasetManifest>>,
}

impl PagedStore {
    fn open(path: &Path) -> Result<Arc<Self>, AtomsError> {
        if !path.exists() {
            return Err(AtomsError::MissingPath(path.display().to_string()));
        }
        let path = fs::canonicalize(path)
            .map_err(|err| AtomsError::Filesystem(format!("{}: {err}", path.display())))?;

        let mut stores = OPEN_STORES.lock();
        stores.retain(|_, store| store.strong_count() > 0);
        if let Some(store) = stores.get(&path).and_then(Weak::upgrade) {
            return Ok(store);
        }

        let db = open_db(&path)?;
        let metadata_bytes = db
            .get(METADATA_KEY)
            .map_err(storage_error)?
            .ok_or_else(|| {
                AtomsError::Storage(format!("{} has no metadata record", path.display()))
            })?;
        let metadata: PagedMetadata =
            bincode::serde::decode_from_slice(&metadata_bytes, standard())
                .map(|(metadata, _)| metadata)
                .map_err(storage_error)?;
        let manifest = match db.get(MANIFEST_KEY).map_err(storage_error)? {
            Some(bytes) => Some(Arc::new(
                serde_json::from_slice::<DatasetManifest>(&bytes).map_err(storage_error)?,
            )),
            None => None,
        };
        tracing::debug!(
            path = %path.display(),
            structures = metadata.structure_sizes.len(),
            "opened paged dataset"
        );

        let store = Arc::new(Self {
            path: path.clone(),
            db,
            metadata,
            manifest,
        });
        stores.insert(path, Arc::downgrade(&store));
        Ok(store)
    }

    fn len(&self) -> usize {
        self.metadata.structure_sizes.len()
    }

    fn read(&self, position: usize) -> Result<Structure, AtomsError> {
        let bytes = self
            .db
            .get(structure_key(position))
            .map_err(storage_error)?
            .ok_or_else(|| {
                AtomsError::Storage(format!(
                    "{} is missing structure {position}",
                    self.path.display()
                ))
            })?;
        let structure: Structure = bincode::serde::decode_from_slice(&bytes, standard())
            .map(|(structure, _)| structure)
            .map_err(storage_error)?;
        Ok(structure.freeze())
    }

    fn key_set(&self, position: usize) -> Option<&KeySet> {
        let set = *self.metadata.record_key_sets.get(position)?;
        self.metadata.key_sets.get(set as usize)
    }
}

fn open_db(path: &Path) -> Result<sled::Db, AtomsError> {
    sled::Config::new()
        .path(path)
        .flush_every_ms(None)
        .open()
        .map_err(|err| AtomsError::Storage(format!("open {}: {err}", path.display())))
}

/// Structures kept on disk in a `sled` store and decoded on every access.
///
/// Structures handed out are frozen: mutating their `info` or `arrays` fails
/// with [`AtomsError::ReadOnly`]. Handles to one store path are shared by
/// every open view in the process; the store is released when the last view
/// is closed or dropped.
pub struct PagedDataset {
    store: Arc<PagedStore>,
    view: Option<Arc<[usize]>>,
    info_columns: LazyColumns<Vec<InfoValue>>,
    array_columns: LazyColumns<AtomArray>,
    species: LazyValue<BTreeMap<String, usize>>,
}

impl PagedDataset {
    pub fn open(path: &Path) -> Result<Self, AtomsError> {
        Ok(Self::view_of(PagedStore::open(path)?, None))
    }

    fn view_of(store: Arc<PagedStore>, view: Option<Arc<[usize]>>) -> Self {
        Self {
            store,
            view,
            info_columns: LazyColumns::new(),
            array_columns: LazyColumns::new(),
            species: LazyValue::new(),
        }
    }

    /// Releases this view's handle on the store.
    pub fn close(self) {
        drop(self);
    }

    pub fn path(&self) -> &Path {
        &self.store.path
    }

    pub fn imported_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.store.metadata.imported_at)
            .ok()
            .map(|time| time.with_timezone(&Utc))
    }

    /// Streams `structures` into a new store at `path`.
    ///
    /// The store is built in a sibling temporary directory and moved into
    /// place only once every record is flushed. Returns `false` when another
    /// writer created `path` first.
    pub fn save<I>(
        path: &Utf8Path,
        structures: I,
        manifest: Option<&DatasetManifest>,
    ) -> Result<bool, AtomsError>
    where
        I: IntoIterator<Item = Result<Structure, AtomsError>>,
    {
        if path.as_std_path().exists() {
            return Ok(false);
        }
        let staging = temp_dir_beside(path)?;
        let db = open_db(staging.path())?;

        let mut structure_sizes = Vec::new();
        let mut key_sets: Vec<KeySet> = Vec::new();
        let mut key_set_ids: HashMap<KeySet, u32> = HashMap::new();
        let mut record_key_sets = Vec::new();
        let mut species_counts = BTreeMap::new();

        for (index, structure) in structures.into_iter().enumerate() {
            let structure = structure?;
            structure.validate()?;

            let key_set = KeySet {
                info: structure.info().keys().cloned().collect(),
                arrays: structure.arrays().keys().cloned().collect(),
            };
            let id = match key_set_ids.get(&key_set) {
                Some(id) => *id,
                None => {
                    let id = key_sets.len() as u32;
                    key_set_ids.insert(key_set.clone(), id);
                    key_sets.push(key_set);
                    id
                }
            };
            record_key_sets.push(id);
            structure_sizes.push(structure.len());
            for symbol in structure.symbols() {
                *species_counts.entry(symbol.to_string()).or_insert(0) += 1;
            }

            let bytes =
                bincode::serde::encode_to_vec(&structure, standard()).map_err(storage_error)?;
            db.insert(structure_key(index), bytes)
                .map_err(storage_error)?;
        }

        let metadata = PagedMetadata {
            structure_sizes,
            key_sets,
            record_key_sets,
            species_counts,
            imported_at: Utc::now().to_rfc3339(),
        };
        let bytes = bincode::serde::encode_to_vec(&metadata, standard()).map_err(storage_error)?;
        db.insert(METADATA_KEY, bytes).map_err(storage_error)?;
        if let Some(manifest) = manifest {
            let bytes = serde_json::to_vec(manifest).map_err(storage_error)?;
            db.insert(MANIFEST_KEY, bytes).map_err(storage_error)?;
        }
        db.flush().map_err(storage_error)?;
        drop(db);

        let staging = staging.keep();
        let moved = atomic_rename_dir(&staging, path.as_std_path())
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        tracing::info!(
            path = %path,
            structures = metadata.structure_sizes.len(),
            moved,
            "wrote paged dataset"
        );
        Ok(moved)
    }

    fn position(&self, index: usize) -> Option<usize> {
        match &self.view {
            Some(view) => view.get(index).copied(),
            None => (index < self.store.len()).then_some(index),
        }
    }

    fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter_map(|index| self.position(index))
    }

    fn members(&self) -> impl Iterator<Item = Result<Structure, AtomsError>> + '_ {
        self.positions().map(|position| self.store.read(position))
    }

    fn shared_keys(&self, pick: fn(&KeySet) -> &Vec<String>) -> Vec<String> {
        intersect_keys(
            self.positions()
                .map(|position| self.store.key_set(position).map(pick).into_iter().flatten()),
        )
    }
}

impl Clone for PagedDataset {
    fn clone(&self) -> Self {
        Self::view_of(self.store.clone(), self.view.clone())
    }
}

impl AtomsDataset for PagedDataset {
    fn len(&self) -> usize {
        match &self.view {
            Some(view) => view.len(),
            None => self.store.len(),
        }
    }

    fn get(&self, index: usize) -> Result<Cow<'_, Structure>, AtomsError> {
        let position = self.position(index).ok_or(AtomsError::IndexOutOfRange {
            index: index as isize,
            len: self.len(),
        })?;
        self.store.read(position).map(Cow::Owned)
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
        Ok(Dataset::Paged(Self::view_of(
            self.store.clone(),
            Some(positions.into()),
        )))
    }

    fn structure_sizes(&self) -> Vec<usize> {
        self.positions()
            .map(|position| self.store.metadata.structure_sizes[position])
            .collect()
    }

    fn info_keys(&self) -> Result<Vec<String>, AtomsError> {
        Ok(self.shared_keys(|set| &set.info))
    }

    fn array_keys(&self) -> Result<Vec<String>, AtomsError> {
        Ok(self.shared_keys(|set| &set.arrays))
    }

    fn info(&self, key: &str) -> Result<Option<Arc<Vec<InfoValue>>>, AtomsError> {
        self.info_columns.get_or_compute(key, || {
            if !self.info_keys()?.iter().any(|known| known == key) {
                return Ok(None);
            }
            self.members()
                .map(|structure| {
                    let structure = structure?;
                    structure.info_value(key).cloned().ok_or_else(|| {
                        AtomsError::Storage(format!("structure is missing info key {key}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some)
        })
    }

    fn arrays(&self, key: &str) -> Result<Option<Arc<AtomArray>>, AtomsError> {
        self.array_columns.get_or_compute(key, || {
            if !self.array_keys()?.iter().any(|known| known == key) {
                return Ok(None);
            }
            let parts = self
                .members()
                .map(|structure| {
                    let structure = structure?;
                    structure.array(key).cloned().ok_or_else(|| {
                        AtomsError::Storage(format!("structure is missing array {key}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            AtomArray::concat(&parts).map(Some)
        })
    }

    fn species_counts(&self) -> Result<Arc<BTreeMap<String, usize>>, AtomsError> {
        self.species.get_or_compute(|| {
            if self.view.is_none() {
                return Ok(self.store.metadata.species_counts.clone());
            }
            let mut counts = BTreeMap::new();
            for structure in self.members() {
                for symbol in structure?.symbols() {
                    *counts.entry(symbol.to_string()).or_insert(0) += 1;
                }
            }
            Ok(counts)
        })
    }

    fn manifest(&self) -> Option<&Arc<DatasetManifest>> {
        self.store.manifest.as_ref()
    }
}
