//! Download, verify, import and cache atomistic structure datasets, and work
//! with them through one indexable, splittable [`Dataset`] type.

pub mod api;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod dataset;
pub mod download;
pub mod elements;
pub mod error;
pub mod fs_util;
pub mod importer;
pub mod io;
pub mod manifest;
pub mod progress;
pub mod store;
pub mod structure;

pub use api::{DatasetSource, load_dataset, load_dataset_with, load_dataset_with_io};
pub use dataset::{AtomsDataset, Dataset, Selection, SplitSizes, StructureFilter};
pub use error::{AtomsError, Result};
pub use structure::{AtomArray, InfoValue, Structure};
