//! Index-level splitting algorithms. Everything here works on positions into
//! a dataset view, so the same code serves both storage backings.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::AtomsError;

/// Requested split sizes: either all fractions of the dataset or all
/// absolute structure counts.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitSizes {
    Fractions(Vec<f64>),
    Counts(Vec<usize>),
}

impl SplitSizes {
    pub fn len(&self) -> usize {
        match self {
            SplitSizes::Fractions(fractions) => fractions.len(),
            SplitSizes::Counts(counts) => counts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of structures each split receives out of `total`.
    pub fn counts(&self, total: usize) -> Result<Vec<usize>, AtomsError> {
        let counts = match self {
            SplitSizes::Counts(counts) => counts.clone(),
            SplitSizes::Fractions(fractions) => {
                if let Some(bad) = fractions.iter().find(|f| !f.is_finite() || **f < 0.0) {
                    return Err(AtomsError::InvalidSplit(format!(
                        "fractions must be finite and non-negative, got {bad}"
                    )));
                }
                fractions
                    .iter()
                    .map(|fraction| (fraction * total as f64).floor() as usize)
                    .collect()
            }
        };
        if counts.is_empty() {
            return Err(AtomsError::InvalidSplit(
                "at least one split size is required".to_string(),
            ));
        }
        let requested: usize = counts.iter().sum();
        if requested > total {
            return Err(AtomsError::InvalidSplit(format!(
                "the sum of the splits ({requested}) cannot exceed the dataset size ({total})"
            )));
        }
        Ok(counts)
    }

    /// The same proportions, normalised to sum to one.
    pub fn normalised(&self) -> Result<SplitSizes, AtomsError> {
        let values: Vec<f64> = match self {
            SplitSizes::Fractions(fractions) => fractions.clone(),
            SplitSizes::Counts(counts) => counts.iter().map(|count| *count as f64).collect(),
        };
        let sum: f64 = values.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return Err(AtomsError::InvalidSplit(
                "split sizes must sum to a positive number".to_string(),
            ));
        }
        Ok(SplitSizes::Fractions(
            values.into_iter().map(|value| value / sum).collect(),
        ))
    }
}

impl From<Vec<f64>> for SplitSizes {
    fn from(fractions: Vec<f64>) -> Self {
        SplitSizes::Fractions(fractions)
    }
}

impl From<Vec<usize>> for SplitSizes {
    fn from(counts: Vec<usize>) -> Self {
        SplitSizes::Counts(counts)
    }
}

impl<const N: usize> From<[f64; N]> for SplitSizes {
    fn from(fractions: [f64; N]) -> Self {
        SplitSizes::Fractions(fractions.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for SplitSizes {
    fn from(counts: [usize; N]) -> Self {
        SplitSizes::Counts(counts.to_vec())
    }
}

pub fn permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    order
}

/// Cuts one seeded permutation of `things` into consecutive blocks.
pub fn random_split<T: Clone>(
    things: &[T],
    sizes: &SplitSizes,
    seed: u64,
) -> Result<Vec<Vec<T>>, AtomsError> {
    let counts = sizes.counts(things.len())?;
    let order = permutation(things.len(), seed);
    let mut start = 0;
    Ok(counts
        .into_iter()
        .map(|count| {
            let block = order[start..start + count]
                .iter()
                .map(|index| things[*index].clone())
                .collect();
            start += count;
            block
        })
        .collect())
}

/// Rotates `things` by `fold·N/k` and takes the final
/// `(fold+1)·N/k − fold·N/k` elements as the test fold.
pub fn k_fold<T: Clone>(things: &[T], k: usize, fold: usize) -> (Vec<T>, Vec<T>) {
    let len = things.len();
    if len == 0 {
        return (Vec::new(), Vec::new());
    }
    let shift = fold * len / k;
    let n_test = (fold + 1) * len / k - shift;
    // np.roll: rotated[i] = things[(i - shift) mod len]
    let rotated: Vec<T> = (0..len)
        .map(|i| things[(i + len - shift % len) % len].clone())
        .collect();
    let (train, test) = rotated.split_at(len - n_test);
    (train.to_vec(), test.to_vec())
}

/// Splits each group of `things` independently and merges the per-group
/// results split by split.
pub fn split_keeping_ratio<T, F>(
    things: &[T],
    group_ids: &[String],
    mut split: F,
) -> Result<Vec<Vec<T>>, AtomsError>
where
    T: Clone,
    F: FnMut(&[T]) -> Result<Vec<Vec<T>>, AtomsError>,
{
    if things.len() != group_ids.len() {
        return Err(AtomsError::InvalidSplit(format!(
            "{} items but {} group ids",
            things.len(),
            group_ids.len()
        )));
    }
    let mut groups: BTreeMap<&str, Vec<T>> = BTreeMap::new();
    for (thing, group) in things.iter().zip(group_ids) {
        groups.entry(group.as_str()).or_default().push(thing.clone());
    }

    let mut merged: Vec<Vec<T>> = Vec::new();
    for members in groups.values() {
        let parts = split(members)?;
        if merged.is_empty() {
            merged = vec![Vec::new(); parts.len()];
        }
        for (target, part) in merged.iter_mut().zip(parts) {
            target.extend(part);
        }
    }
    Ok(merged)
}

/// Up to `n` items, drawn without replacement by a seeded permutation.
pub fn choose_n<T: Clone>(things: &[T], n: usize, seed: u64) -> Vec<T> {
    permutation(things.len(), seed)
        .into_iter()
        .take(n)
        .map(|index| things[index].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn permutation_is_seeded() {
        assert_eq!(permutation(50, 7), permutation(50, 7));
        assert_ne!(permutation(50, 7), permutation(50, 8));
        let sorted: BTreeSet<usize> = permutation(50, 7).into_iter().collect();
        assert_eq!(sorted.len(), 50);
    }

    #[test]
    fn counts_floor_fractions() {
        let sizes = SplitSizes::from([0.8, 0.1, 0.1]);
        assert_eq!(sizes.counts(15).unwrap(), vec![12, 1, 1]);
        assert!(SplitSizes::from([8usize, 8]).counts(15).is_err());
        assert!(SplitSizes::from([-0.5, 0.5]).counts(15).is_err());
    }

    #[test]
    fn k_fold_rotation_matches_roll() {
        let items: Vec<usize> = (0..10).collect();
        let (train, test) = k_fold(&items, 5, 0);
        assert_eq!(test, vec![8, 9]);
        assert_eq!(train, (0..8).collect::<Vec<_>>());
        let (_, test) = k_fold(&items, 5, 1);
        assert_eq!(test, vec![6, 7]);
    }

    #[test]
    fn k_fold_partitions_uneven_lengths() {
        let items: Vec<usize> = (0..13).collect();
        let mut seen = Vec::new();
        for fold in 0..4 {
            let (train, test) = k_fold(&items, 4, fold);
            assert_eq!(train.len() + test.len(), 13);
            seen.extend(test);
        }
        seen.sort();
        assert_eq!(seen, items);
    }

    #[test]
    fn ratio_split_splits_each_group() {
        let items: Vec<usize> = (0..20).collect();
        let groups: Vec<String> = items
            .iter()
            .map(|i| if i % 4 == 0 { "a".to_string() } else { "b".to_string() })
            .collect();
        let splits = split_keeping_ratio(&items, &groups, |members| {
            random_split(members, &SplitSizes::from([0.6, 0.4]), 1)
        })
        .unwrap();
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0].len(), 3 + 9);
        assert_eq!(splits[1].len(), 2 + 6);
    }

    #[test]
    fn choose_n_caps_at_length() {
        assert_eq!(choose_n(&[1, 2, 3], 10, 0).len(), 3);
        assert_eq!(choose_n(&[1, 2, 3], 2, 0).len(), 2);
    }
}
