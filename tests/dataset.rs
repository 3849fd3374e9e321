use std::collections::{BTreeMap, BTreeSet};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use load_atoms::dataset::{
    AtomsDataset, Dataset, InMemoryDataset, PagedDataset, Selection, StructureFilter,
};
use load_atoms::error::AtomsError;
use load_atoms::structure::{AtomArray, InfoValue, Structure};

fn structures(n: usize) -> Vec<Structure> {
    (0..n)
        .map(|i| {
            let symbols: &[&str] = if i % 2 == 0 { &["C", "H", "H"] } else { &["O", "H"] };
            let positions: Vec<[f64; 3]> =
                (0..symbols.len()).map(|j| [j as f64, 0.0, 0.0]).collect();
            let mut structure = Structure::from_symbols(symbols, &positions).unwrap();
            structure.set_info("index", i).unwrap();
            structure
                .set_info("config_type", if i % 4 == 0 { "bulk" } else { "surface" })
                .unwrap();
            structure
                .set_array("forces", AtomArray::vectors(&vec![[0.5, 0.0, 0.0]; symbols.len()]))
                .unwrap();
            structure
        })
        .collect()
}

fn dataset(n: usize) -> Dataset {
    Dataset::from_structures(structures(n))
}

fn indices_of(dataset: &Dataset) -> Vec<i64> {
    dataset
        .iter()
        .map(|structure| {
            structure
                .unwrap()
                .info_value("index")
                .and_then(InfoValue::as_i64)
                .unwrap()
        })
        .collect()
}

#[test]
fn indexing_matches_iteration() {
    let dataset = dataset(6);
    let listed: Vec<Structure> = dataset.iter().map(|s| s.unwrap().into_owned()).collect();
    for (i, structure) in listed.iter().enumerate() {
        assert_eq!(&*dataset.get(i).unwrap(), structure);
    }
    assert_eq!(&*dataset.get_signed(-1).unwrap(), &listed[5]);
    assert_matches!(
        dataset.get_signed(-7),
        Err(AtomsError::IndexOutOfRange { index: -7, len: 6 })
    );

    let everything = dataset.select((0..6).collect::<Vec<usize>>()).unwrap();
    assert_eq!(everything.to_vec().unwrap(), listed);
}

#[test]
fn slices_follow_python_semantics() {
    let dataset = dataset(10);
    let tail = dataset.select(Selection::slice(Some(-3), None, 1)).unwrap();
    assert_eq!(indices_of(&tail), vec![7, 8, 9]);
    let reversed = dataset.select(Selection::slice(None, None, -3)).unwrap();
    assert_eq!(indices_of(&reversed), vec![9, 6, 3, 0]);
    let head = dataset.select(..2usize).unwrap();
    assert_eq!(indices_of(&head), vec![0, 1]);
    let picked = dataset.select(vec![-1isize, 0, -2]).unwrap();
    assert_eq!(indices_of(&picked), vec![9, 0, 8]);
    assert_matches!(
        dataset.select(vec![-11isize]),
        Err(AtomsError::IndexOutOfRange { index: -11, len: 10 })
    );
}

#[test]
fn mask_length_mismatch_is_a_usage_error() {
    let dataset = dataset(10);
    let err = dataset.select(vec![true; 7]).unwrap_err();
    assert_matches!(err, AtomsError::MaskLength { expected: 10, actual: 7 });
    assert!(err.is_usage_error());

    let mask: Vec<bool> = (0..10).map(|i| i % 3 == 0).collect();
    assert_eq!(indices_of(&dataset.select(mask).unwrap()), vec![0, 3, 6, 9]);
}

#[test]
fn views_keep_the_manifest_reference() {
    let dataset = dataset(4);
    assert!(dataset.manifest().is_none());
    let view = dataset.select(1usize..3).unwrap();
    assert!(view.manifest().is_none());
    assert_eq!(view.len(), 2);
}

#[test]
fn info_and_arrays_follow_the_intersection_contract() {
    let mut members = structures(5);
    members[2].set_info("only_here", 1.0).unwrap();
    let dataset = Dataset::from_structures(members);

    let keys = dataset.info_keys().unwrap();
    assert!(keys.contains(&"index".to_string()));
    assert!(!keys.contains(&"only_here".to_string()));
    assert!(dataset.info("only_here").unwrap().is_none());

    for key in &keys {
        assert_eq!(dataset.info(key).unwrap().unwrap().len(), dataset.len());
    }
    for key in dataset.array_keys().unwrap() {
        assert_eq!(dataset.arrays(&key).unwrap().unwrap().rows(), dataset.n_atoms());
    }

    let single = dataset.select(vec![2usize]).unwrap();
    assert_eq!(single.info("only_here").unwrap().unwrap().len(), 1);
}

#[test]
fn filter_by_predicates_and_fields() {
    let dataset = dataset(12);
    let bulk = dataset
        .filter_by(&StructureFilter::new().info_equals("config_type", "bulk"))
        .unwrap();
    assert_eq!(indices_of(&bulk), vec![0, 4, 8]);

    let small_bulk = dataset
        .filter_by(
            &StructureFilter::new()
                .info_equals("config_type", "bulk")
                .predicate(|structure| structure.len() < 3),
        )
        .unwrap();
    assert!(small_bulk.is_empty());

    let missing = dataset
        .filter_by(&StructureFilter::new().info_equals("absent", 1))
        .unwrap();
    assert!(missing.is_empty());
}

#[test]
fn random_split_is_disjoint_and_covers_everything() {
    let dataset = dataset(100);
    let splits = dataset.random_split([0.8, 0.1, 0.1], 42, None).unwrap();
    assert_eq!(
        splits.iter().map(|split| split.len()).collect::<Vec<_>>(),
        vec![80, 10, 10]
    );
    let mut seen = BTreeSet::new();
    for split in &splits {
        for index in indices_of(split) {
            assert!(seen.insert(index));
        }
    }
    assert_eq!(seen.len(), 100);

    let again = dataset.random_split([0.8, 0.1, 0.1], 42, None).unwrap();
    assert_eq!(indices_of(&again[1]), indices_of(&splits[1]));

    let counts = dataset.random_split([30usize, 20], 0, None).unwrap();
    assert_eq!(counts[0].len(), 30);
    assert_eq!(counts[1].len(), 20);
    assert_matches!(
        dataset.random_split([60usize, 60], 0, None),
        Err(AtomsError::InvalidSplit(_))
    );
}

fn bulk_share(dataset: &Dataset) -> f64 {
    let column = dataset.info("config_type").unwrap().unwrap();
    let bulk = column
        .iter()
        .filter(|value| value.as_str() == Some("bulk"))
        .count();
    bulk as f64 / column.len() as f64
}

#[test]
fn keep_ratio_preserves_group_proportions() {
    let dataset = dataset(200);
    assert!((bulk_share(&dataset) - 0.25).abs() < 1e-9);

    let splits = dataset
        .random_split([0.5, 0.5], 7, Some("config_type"))
        .unwrap();
    for split in &splits {
        assert!((bulk_share(split) - 0.25).abs() < 0.02);
    }

    let trimmed = dataset
        .random_split([40usize, 20], 7, Some("config_type"))
        .unwrap();
    assert_eq!(trimmed[0].len(), 40);
    assert_eq!(trimmed[1].len(), 20);
}

#[test]
fn keep_ratio_on_unknown_field_names_it() {
    let dataset = dataset(10);
    let err = dataset.random_split([0.5, 0.5], 0, Some("colour")).unwrap_err();
    assert_matches!(
        &err,
        AtomsError::UnknownKey { key, available }
            if key == "colour" && available.contains(&"index".to_string())
    );
    assert!(err.to_string().contains("colour"));
}

#[test]
fn k_fold_test_folds_partition_the_dataset() {
    for n in [10usize, 17, 23] {
        let dataset = dataset(n);
        for k in 2..=10 {
            for shuffle in [true, false] {
                let mut seen = Vec::new();
                for fold in 0..k {
                    let (train, test) = dataset
                        .k_fold_split(k, fold as i64, shuffle, 42, None)
                        .unwrap();
                    assert_eq!(train.len() + test.len(), n);
                    let test_indices = indices_of(&test);
                    let train_indices: BTreeSet<i64> = indices_of(&train).into_iter().collect();
                    assert!(test_indices.iter().all(|index| !train_indices.contains(index)));
                    seen.extend(test_indices);
                }
                seen.sort();
                assert_eq!(seen, (0..n as i64).collect::<Vec<_>>(), "n={n} k={k}");
            }
        }
    }
}

#[test]
fn k_fold_wraps_negative_folds() {
    let dataset = dataset(20);
    let (_, last) = dataset.k_fold_split(5, 4, true, 1, None).unwrap();
    let (_, wrapped) = dataset.k_fold_split(5, -1, true, 1, None).unwrap();
    assert_eq!(indices_of(&last), indices_of(&wrapped));
}

#[test]
fn k_fold_needs_at_least_two_folds() {
    let err = dataset(10).k_fold_split(1, 0, true, 42, None).unwrap_err();
    assert!(err.is_usage_error());
    assert!(err.to_string().contains("at least 2"));
}

#[test]
fn k_fold_keep_ratio_requires_shuffle() {
    let dataset = dataset(40);
    assert_matches!(
        dataset.k_fold_split(4, 0, false, 0, Some("config_type")),
        Err(AtomsError::KeepRatioRequiresShuffle)
    );
    assert_matches!(
        dataset.k_fold_split(4, 0, true, 0, Some("colour")),
        Err(AtomsError::UnknownKey { .. })
    );

    let mut seen = Vec::new();
    for fold in 0..4 {
        let (train, test) = dataset
            .k_fold_split(4, fold, true, 0, Some("config_type"))
            .unwrap();
        assert_eq!(train.len() + test.len(), 40);
        assert!((bulk_share(&test) - 0.25).abs() < 0.05);
        seen.extend(indices_of(&test));
    }
    seen.sort();
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}

#[test]
fn summary_lists_species_and_properties() {
    let summary = dataset(2).summary().unwrap();
    assert_eq!(summary.name, "Dataset");
    assert_eq!(summary.structures, 2);
    assert_eq!(summary.atoms, 5);
    assert_eq!(summary.species[0].0, "H");
    assert_eq!(summary.per_atom_properties, vec!["forces".to_string()]);

    let text = summary.to_string();
    assert!(text.starts_with("Dataset:"));
    assert!(text.contains("H: 60.00%"));
    assert!(text.contains("per atom: (forces)"));
    assert!(text.contains("per structure: (config_type, index)"));

    let large = dataset(1000).summary().unwrap().to_string();
    assert!(large.contains("structures: 1,000"));
}

#[test]
fn species_counts_add_up_to_atoms() {
    let dataset = dataset(9);
    let counts = dataset.species_counts().unwrap();
    assert_eq!(counts.values().sum::<usize>(), dataset.n_atoms());
    let expected: BTreeMap<String, usize> = [
        ("C".to_string(), 5),
        ("H".to_string(), 14),
        ("O".to_string(), 4),
    ]
    .into_iter()
    .collect();
    assert_eq!(*counts, expected);
}

#[test]
fn paged_datasets_behave_like_in_memory_ones() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("set.paged")).unwrap();
    let members = structures(12);
    assert!(PagedDataset::save(&path, members.clone().into_iter().map(Ok), None).unwrap());

    let paged = Dataset::load(path.as_std_path()).unwrap();
    let memory = Dataset::Memory(InMemoryDataset::new(members, None));
    assert_eq!(paged.len(), memory.len());
    assert_eq!(paged.structure_sizes(), memory.structure_sizes());
    assert_eq!(paged.info_keys().unwrap(), memory.info_keys().unwrap());
    assert_eq!(paged.info("index").unwrap(), memory.info("index").unwrap());
    assert_eq!(paged.arrays("forces").unwrap(), memory.arrays("forces").unwrap());
    assert_eq!(paged.species_counts().unwrap(), memory.species_counts().unwrap());

    let (_, paged_test) = paged.k_fold_split(3, 1, true, 9, None).unwrap();
    let (_, memory_test) = memory.k_fold_split(3, 1, true, 9, None).unwrap();
    assert_eq!(indices_of(&paged_test), indices_of(&memory_test));
    assert_eq!(
        paged_test.species_counts().unwrap(),
        memory_test.species_counts().unwrap()
    );
}

#[test]
fn paged_structures_are_read_only() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("ro.paged")).unwrap();
    PagedDataset::save(&path, structures(3).into_iter().map(Ok), None).unwrap();
    let dataset = PagedDataset::open(path.as_std_path()).unwrap();

    let mut structure = dataset.get(1).unwrap().into_owned();
    let err = structure.set_info("x", 1).unwrap_err();
    assert_matches!(err, AtomsError::ReadOnly { attribute: "info" });
    assert!(err.is_usage_error());
    assert_matches!(
        structure.set_array("x", AtomArray::scalars(vec![0.0; structure.len()])),
        Err(AtomsError::ReadOnly { attribute: "arrays" })
    );

    let fresh = dataset.get(1).unwrap();
    assert!(fresh.info_value("x").is_none());
    assert!(fresh.array("x").is_none());

    let mut copy = fresh.thawed();
    copy.set_info("x", 1).unwrap();
    dataset.close();
}
