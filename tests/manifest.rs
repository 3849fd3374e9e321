use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use load_atoms::backend::Backend;
use load_atoms::config::Settings;
use load_atoms::dataset::AtomsDataset;
use load_atoms::download::{DownloadClient, RemoteBody};
use load_atoms::error::AtomsError;
use load_atoms::importer::ImporterRegistry;
use load_atoms::manifest::{
    DatasetManifest, is_known_dataset, known_dataset_ids, load_all_manifests,
    reset_known_manifests,
};
use load_atoms::structure::Structure;

const BASE: &str = "https://mock.test/database";

struct FileServer {
    files: HashMap<String, Vec<u8>>,
    requested: Mutex<Vec<String>>,
}

impl DownloadClient for FileServer {
    fn open(&self, url: &str) -> Result<RemoteBody, AtomsError> {
        self.requested.lock().unwrap().push(url.to_string());
        let body = self.files.get(url).cloned().ok_or_else(|| AtomsError::HttpStatus {
            url: url.to_string(),
            status: 404,
        })?;
        Ok(RemoteBody {
            len: Some(body.len() as u64),
            reader: Box::new(Cursor::new(body)),
        })
    }
}

const WATER: &str = r#"{
    "name": "Water-3",
    "year": 2023,
    "description": "Three water molecules.",
    "category": "Synthetic Data",
    "license": "CC0",
    "filename": "water.jsonl",
    "hash": "abcdef012345"
}"#;

#[test]
fn bundled_manifests_skip_the_manifest_download() {
    reset_known_manifests();
    let manifests = tempfile::tempdir().unwrap();
    fs::create_dir(manifests.path().join("synthetic")).unwrap();
    fs::write(manifests.path().join("synthetic/Water-3.json"), WATER).unwrap();
    fs::write(manifests.path().join("README.md"), "not a manifest").unwrap();

    assert_eq!(load_all_manifests(manifests.path()).unwrap(), 1);
    assert!(is_known_dataset("Water-3"));
    assert_eq!(known_dataset_ids(), vec!["Water-3".to_string()]);

    let water = Structure::from_symbols(&["O", "H", "H"], &[[0.0; 3]; 3]).unwrap();
    let line = serde_json::to_string(&water).unwrap();
    let body = format!("{line}\n{line}\n{line}\n");
    let server = FileServer {
        files: HashMap::from([(format!("{BASE}/Water-3/water.jsonl"), body.into_bytes())]),
        requested: Mutex::new(Vec::new()),
    };

    let cache = tempfile::tempdir().unwrap();
    let mut settings =
        Settings::with_root(Utf8PathBuf::from_path_buf(cache.path().to_path_buf()).unwrap());
    settings.base_remote_url = BASE.to_string();
    settings.verbose = false;
    let backend = Backend::new(settings, server).with_registry(ImporterRegistry::empty());

    let loaded = backend.load("Water-3").unwrap();
    assert_eq!(loaded.dataset.len(), 3);
    assert_eq!(
        *backend.client().requested.lock().unwrap(),
        vec![format!("{BASE}/Water-3/water.jsonl")]
    );

    let written = backend.layout().manifest_path("Water-3");
    let copy = DatasetManifest::from_file(written.as_std_path()).unwrap();
    assert_eq!(copy, *loaded.manifest);
    reset_known_manifests();
}

#[test]
fn malformed_manifest_reports_its_location() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("Broken.json");
    fs::write(&path, r#"{"name": "Broken", "year": "soon"}"#).unwrap();
    let err = DatasetManifest::from_file(&path).unwrap_err();
    assert_matches!(
        err,
        AtomsError::ManifestParse { ref location, .. } if location.contains("Broken.json")
    );
}
