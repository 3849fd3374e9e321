//! The indexable, splittable structure collection.
//!
//! [`AtomsDataset`] carries the storage-level operations each backing
//! implements and the algorithms built on top of them (selection, filtering,
//! random and k-fold splits, summaries). [`Dataset`] picks a backing at
//! construction time.

mod lazy;
mod memory;
mod paged;
pub mod split;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Range, RangeFrom, RangeFull, RangeInclusive, RangeTo};
use std::path::Path;
use std::sync::Arc;

pub use memory::InMemoryDataset;
pub use paged::PagedDataset;
pub use split::SplitSizes;

use crate::error::AtomsError;
use crate::manifest::{DatasetManifest, StorageFormat};
use crate::structure::{AtomArray, InfoValue, NUMBERS, POSITIONS, Structure};

pub trait AtomsDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed from memory for the in-memory backing; freshly decoded and
    /// read-only for the paged backing.
    fn get(&self, index: usize) -> Result<Cow<'_, Structure>, AtomsError>;

    /// A new view over `indices` (positions in this view), in that order.
    fn select_indices(&self, indices: &[usize]) -> Result<Dataset, AtomsError>;

    fn structure_sizes(&self) -> Vec<usize>;

    /// Per-structure keys defined on every structure of this view.
    fn info_keys(&self) -> Result<Vec<String>, AtomsError>;

    /// Per-atom keys defined on every structure of this view.
    fn array_keys(&self) -> Result<Vec<String>, AtomsError>;

    /// One value per structure, or `None` unless every structure defines `key`.
    fn info(&self, key: &str) -> Result<Option<Arc<Vec<InfoValue>>>, AtomsError>;

    /// Rows for every atom of the view, or `None` unless every structure
    /// defines `key`.
    fn arrays(&self, key: &str) -> Result<Option<Arc<AtomArray>>, AtomsError>;

    fn species_counts(&self) -> Result<Arc<BTreeMap<String, usize>>, AtomsError>;

    fn manifest(&self) -> Option<&Arc<DatasetManifest>>;

    fn iter(&self) -> Iter<'_, Self>
    where
        Self: Sized,
    {
        Iter {
            dataset: self,
            next: 0,
        }
    }

    /// Python-style indexing: negative indices count from the end.
    fn get_signed(&self, index: isize) -> Result<Cow<'_, Structure>, AtomsError> {
        self.get(resolve_signed(index, self.len())?)
    }

    /// Independent, mutable copies of every structure.
    fn to_vec(&self) -> Result<Vec<Structure>, AtomsError> {
        (0..self.len())
            .map(|index| self.get(index).map(|structure| structure.thawed()))
            .collect()
    }

    fn select(&self, selection: impl Into<Selection>) -> Result<Dataset, AtomsError>
    where
        Self: Sized,
    {
        let indices = selection.into().resolve(self.len())?;
        self.select_indices(&indices)
    }

    fn n_atoms(&self) -> usize {
        self.structure_sizes().iter().sum()
    }

    fn filter_by(&self, filter: &StructureFilter) -> Result<Dataset, AtomsError> {
        let mut keep = Vec::new();
        for index in 0..self.len() {
            if filter.matches(&*self.get(index)?) {
                keep.push(index);
            }
        }
        self.select_indices(&keep)
    }

    fn random_split(
        &self,
        sizes: impl Into<SplitSizes>,
        seed: u64,
        keep_ratio: Option<&str>,
    ) -> Result<Vec<Dataset>, AtomsError>
    where
        Self: Sized,
    {
        let sizes = sizes.into();
        let positions: Vec<usize> = (0..self.len()).collect();
        let Some(key) = keep_ratio else {
            return split::random_split(&positions, &sizes, seed)?
                .iter()
                .map(|indices| self.select_indices(indices))
                .collect();
        };

        let groups = group_ids(self, key, &positions)?;
        let final_sizes = sizes.counts(self.len())?;
        let normalised = sizes.normalised()?;
        let mut splits = split::split_keeping_ratio(&positions, &groups, |members| {
            split::random_split(members, &normalised, seed)
        })?;
        splits.resize(final_sizes.len(), Vec::new());
        splits
            .iter()
            .zip(final_sizes)
            .map(|(indices, size)| self.select_indices(&split::choose_n(indices, size, seed)))
            .collect()
    }

    /// Train and test views for `fold` (taken modulo `k`) of a `k`-fold
    /// cross-validation. Test folds over `fold = 0..k` partition the dataset.
    fn k_fold_split(
        &self,
        k: usize,
        fold: i64,
        shuffle: bool,
        seed: u64,
        keep_ratio: Option<&str>,
    ) -> Result<(Dataset, Dataset), AtomsError>
    where
        Self: Sized,
    {
        if k < 2 {
            return Err(AtomsError::InvalidFolds { k });
        }
        let fold = fold.rem_euclid(k as i64) as usize;
        let order = if shuffle {
            split::permutation(self.len(), seed)
        } else {
            (0..self.len()).collect()
        };

        let (train, test) = match keep_ratio {
            None => split::k_fold(&order, k, fold),
            Some(key) => {
                let groups = group_ids(self, key, &order)?;
                if !shuffle {
                    return Err(AtomsError::KeepRatioRequiresShuffle);
                }
                let mut merged = split::split_keeping_ratio(&order, &groups, |members| {
                    let (train, test) = split::k_fold(members, k, fold);
                    Ok(vec![train, test])
                })?;
                merged.resize(2, Vec::new());
                let test = merged.pop().unwrap_or_default();
                let train = merged.pop().unwrap_or_default();
                (train, test)
            }
        };
        Ok((self.select_indices(&train)?, self.select_indices(&test)?))
    }

    fn summary(&self) -> Result<DatasetSummary, AtomsError> {
        let atoms = self.n_atoms();
        let counts = self.species_counts()?;
        let mut species: Vec<(String, f64)> = counts
            .iter()
            .map(|(symbol, count)| {
                let share = if atoms == 0 {
                    0.0
                } else {
                    *count as f64 / atoms as f64
                };
                (symbol.clone(), share)
            })
            .collect();
        species.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let per_atom_properties = self
            .array_keys()?
            .into_iter()
            .filter(|key| key != NUMBERS && key != POSITIONS)
            .collect();
        Ok(DatasetSummary {
            name: self
                .manifest()
                .map(|manifest| manifest.name.clone())
                .unwrap_or_else(|| "Dataset".to_string()),
            structures: self.len(),
            atoms,
            species,
            per_atom_properties,
            per_structure_properties: self.info_keys()?,
        })
    }
}

fn group_ids<D: AtomsDataset + ?Sized>(
    dataset: &D,
    key: &str,
    order: &[usize],
) -> Result<Vec<String>, AtomsError> {
    let column = dataset.info(key)?.ok_or_else(|| AtomsError::UnknownKey {
        key: key.to_string(),
        available: dataset.info_keys().unwrap_or_default(),
    })?;
    Ok(order
        .iter()
        .map(|index| column[*index].group_key())
        .collect())
}

pub struct Iter<'a, D: ?Sized> {
    dataset: &'a D,
    next: usize,
}

impl<'a, D: AtomsDataset + ?Sized> Iterator for Iter<'a, D> {
    type Item = Result<Cow<'a, Structure>, AtomsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.len() {
            return None;
        }
        let item = self.dataset.get(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// Which structures of a view to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Python slice semantics, negative bounds count from the end.
    Slice {
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    },
    /// Negative entries count from the end.
    Indices(Vec<isize>),
    Mask(Vec<bool>),
}

impl Selection {
    pub fn slice(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Selection::Slice { start, stop, step }
    }

    pub fn resolve(&self, len: usize) -> Result<Vec<usize>, AtomsError> {
        match self {
            Selection::Slice { start, stop, step } => slice_indices(len, *start, *stop, *step),
            Selection::Indices(indices) => indices
                .iter()
                .map(|&index| resolve_signed(index, len))
                .collect(),
            Selection::Mask(mask) => {
                if mask.len() != len {
                    return Err(AtomsError::MaskLength {
                        expected: len,
                        actual: mask.len(),
                    });
                }
                Ok(mask
                    .iter()
                    .enumerate()
                    .filter_map(|(index, keep)| keep.then_some(index))
                    .collect())
            }
        }
    }
}

fn resolve_signed(index: isize, len: usize) -> Result<usize, AtomsError> {
    let resolved = if index < 0 {
        index.checked_add(len as isize)
    } else {
        Some(index)
    };
    match resolved {
        Some(position) if position >= 0 && (position as usize) < len => Ok(position as usize),
        _ => Err(AtomsError::IndexOutOfRange { index, len }),
    }
}

fn slice_indices(
    len: usize,
    start: Option<isize>,
    stop: Option<isize>,
    step: isize,
) -> Result<Vec<usize>, AtomsError> {
    if step == 0 {
        return Err(AtomsError::InvalidSelection(
            "slice step cannot be zero".to_string(),
        ));
    }
    let len = len as isize;
    let adjust = |bound: isize, low: isize, high: isize| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };
    let mut indices = Vec::new();
    if step > 0 {
        let start = start.map_or(0, |value| adjust(value, 0, len));
        let stop = stop.map_or(len, |value| adjust(value, 0, len));
        let mut current = start;
        while current < stop {
            indices.push(current as usize);
            current += step;
        }
    } else {
        let start = start.map_or(len - 1, |value| adjust(value, -1, len - 1));
        let stop = stop.map_or(-1, |value| adjust(value, -1, len - 1));
        let mut current = start;
        while current > stop {
            indices.push(current as usize);
            current += step;
        }
    }
    Ok(indices)
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::from(indices.as_slice())
    }
}

impl From<&[usize]> for Selection {
    fn from(indices: &[usize]) -> Self {
        Selection::Indices(indices.iter().map(|&index| index as isize).collect())
    }
}

impl From<Vec<isize>> for Selection {
    fn from(indices: Vec<isize>) -> Self {
        Selection::Indices(indices)
    }
}

impl From<&[isize]> for Selection {
    fn from(indices: &[isize]) -> Self {
        Selection::Indices(indices.to_vec())
    }
}

impl From<Vec<bool>> for Selection {
    fn from(mask: Vec<bool>) -> Self {
        Selection::Mask(mask)
    }
}

impl From<&[bool]> for Selection {
    fn from(mask: &[bool]) -> Self {
        Selection::Mask(mask.to_vec())
    }
}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Selection::slice(Some(range.start as isize), Some(range.end as isize), 1)
    }
}

impl From<RangeInclusive<usize>> for Selection {
    fn from(range: RangeInclusive<usize>) -> Self {
        Selection::slice(
            Some(*range.start() as isize),
            Some(*range.end() as isize + 1),
            1,
        )
    }
}

impl From<RangeFrom<usize>> for Selection {
    fn from(range: RangeFrom<usize>) -> Self {
        Selection::slice(Some(range.start as isize), None, 1)
    }
}

impl From<RangeTo<usize>> for Selection {
    fn from(range: RangeTo<usize>) -> Self {
        Selection::slice(None, Some(range.end as isize), 1)
    }
}

impl From<RangeFull> for Selection {
    fn from(_: RangeFull) -> Self {
        Selection::slice(None, None, 1)
    }
}

type Predicate = Box<dyn Fn(&Structure) -> bool + Send + Sync>;

/// Keeps structures passing every predicate whose `info` also matches every
/// required value. A missing field fails the filter.
#[derive(Default)]
pub struct StructureFilter {
    predicates: Vec<Predicate>,
    equals: Vec<(String, InfoValue)>,
}

impl StructureFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Structure) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn info_equals(mut self, key: impl Into<String>, value: impl Into<InfoValue>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, structure: &Structure) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| structure.info_value(key) == Some(value))
            && self.predicates.iter().all(|predicate| predicate(structure))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub name: String,
    pub structures: usize,
    pub atoms: usize,
    /// Share of all atoms per species, most common first.
    pub species: Vec<(String, f64)>,
    pub per_atom_properties: Vec<String>,
    pub per_structure_properties: Vec<String>,
}

impl fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        writeln!(f, "    structures: {}", group_thousands(self.structures))?;
        writeln!(f, "    atoms: {}", group_thousands(self.atoms))?;
        writeln!(f, "    species:")?;
        for (symbol, share) in &self.species {
            writeln!(f, "        {symbol}: {:.2}%", share * 100.0)?;
        }
        writeln!(f, "    properties:")?;
        writeln!(f, "        per atom: ({})", self.per_atom_properties.join(", "))?;
        write!(
            f,
            "        per structure: ({})",
            self.per_structure_properties.join(", ")
        )
    }
}

fn group_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (position, digit) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

/// The collection, backed either fully in memory or by a paged on-disk store.
#[derive(Clone)]
pub enum Dataset {
    Memory(InMemoryDataset),
    Paged(PagedDataset),
}

impl Dataset {
    pub fn from_structures(structures: Vec<Structure>) -> Self {
        Dataset::Memory(InMemoryDataset::new(structures, None))
    }

    /// Opens a saved dataset: a directory is a paged store, a file an
    /// in-memory artifact.
    pub fn load(path: &Path) -> Result<Self, AtomsError> {
        if path.is_dir() {
            Ok(Dataset::Paged(PagedDataset::open(path)?))
        } else {
            Ok(Dataset::Memory(InMemoryDataset::load(path)?))
        }
    }

    pub fn storage_format(&self) -> StorageFormat {
        match self {
            Dataset::Memory(_) => StorageFormat::Memory,
            Dataset::Paged(_) => StorageFormat::Paged,
        }
    }

    fn inner(&self) -> &dyn AtomsDataset {
        match self {
            Dataset::Memory(dataset) => dataset,
            Dataset::Paged(dataset) => dataset,
        }
    }
}

impl AtomsDataset for Dataset {
    fn len(&self) -> usize {
        self.inner().len()
    }

    fn get(&self, index: usize) -> Result<Cow<'_, Structure>, AtomsError> {
        self.inner().get(index)
    }

    fn select_indices(&self, indices: &[usize]) -> Result<Dataset, AtomsError> {
        self.inner().select_indices(indices)
    }

    fn structure_sizes(&self) -> Vec<usize> {
        self.inner().structure_sizes()
    }

    fn info_keys(&self) -> Result<Vec<String>, AtomsError> {
        self.inner().info_keys()
    }

    fn array_keys(&self) -> Result<Vec<String>, AtomsError> {
        self.inner().array_keys()
    }

    fn info(&self, key: &str) -> Result<Option<Arc<Vec<InfoValue>>>, AtomsError> {
        self.inner().info(key)
    }

    fn arrays(&self, key: &str) -> Result<Option<Arc<AtomArray>>, AtomsError> {
        self.inner().arrays(key)
    }

    fn species_counts(&self) -> Result<Arc<BTreeMap<String, usize>>, AtomsError> {
        self.inner().species_counts()
    }

    fn manifest(&self) -> Option<&Arc<DatasetManifest>> {
        self.inner().manifest()
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("format", &self.storage_format())
            .field("len", &self.len())
            .field("name", &self.manifest().map(|manifest| manifest.name.as_str()))
            .finish()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = Result<Cow<'a, Structure>, AtomsError>;
    type IntoIter = Iter<'a, Dataset>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Keys shared by every key set.
fn intersect_keys<'a, I, K>(sets: I) -> Vec<String>
where
    I: IntoIterator<Item = K>,
    K: IntoIterator<Item = &'a String>,
{
    let mut sets = sets.into_iter();
    let Some(first) = sets.next() else {
        return Vec::new();
    };
    let mut shared: BTreeSet<&String> = first.into_iter().collect();
    for set in sets {
        let set: BTreeSet<&String> = set.into_iter().collect();
        shared.retain(|key| set.contains(key));
        if shared.is_empty() {
            break;
        }
    }
    shared.into_iter().cloned().collect()
}

fn count_species<'a, I>(structures: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Structure>,
{
    let mut counts = BTreeMap::new();
    for structure in structures {
        for symbol in structure.symbols() {
            *counts.entry(symbol.to_string()).or_insert(0) += 1;
        }
    }
    counts
}
