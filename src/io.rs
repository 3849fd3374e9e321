use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::AtomsError;
use crate::structure::Structure;

/// Reads and writes structure-bearing files.
///
/// Implementations must preserve per-structure `info` and per-atom `arrays`
/// losslessly. Callers plug in readers for domain formats (extended XYZ and
/// friends); the crate itself ships [`JsonLinesIo`].
pub trait StructureIo: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<Structure>, AtomsError>;
    fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), AtomsError>;
}

/// One JSON-encoded structure per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesIo;

impl StructureIo for JsonLinesIo {
    fn read(&self, path: &Path) -> Result<Vec<Structure>, AtomsError> {
        let file = File::open(path)
            .map_err(|err| AtomsError::Filesystem(format!("open {}: {err}", path.display())))?;
        let mut structures = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| AtomsError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let structure: Structure = serde_json::from_str(&line).map_err(|err| {
                AtomsError::InvalidStructure(format!(
                    "{}:{}: {err}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            structure.validate()?;
            structures.push(structure);
        }
        Ok(structures)
    }

    fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), AtomsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        }
        let file =
            File::create(path).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        let mut writer = BufWriter::new(file);
        for structure in structures {
            serde_json::to_writer(&mut writer, structure)
                .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
            writer
                .write_all(b"\n")
                .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{AtomArray, InfoValue};

    #[test]
    fn json_lines_preserve_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("water.jsonl");

        let mut water = Structure::from_symbols(&["O", "H", "H"], &[[0.0; 3]; 3]).unwrap();
        water.set_info("energy", -14.2).unwrap();
        water.set_info("config_type", "molecule").unwrap();
        water
            .set_array("forces", AtomArray::vectors(&[[0.1, 0.2, 0.3]; 3]))
            .unwrap();
        let h2 = Structure::from_symbols(&["H", "H"], &[[0.0; 3], [0.74, 0.0, 0.0]])
            .unwrap()
            .with_cell([[5.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 5.0]], [true; 3]);

        JsonLinesIo.write(&path, &[water.clone(), h2.clone()]).unwrap();
        let read = JsonLinesIo.read(&path).unwrap();

        assert_eq!(read, vec![water, h2]);
        assert_eq!(
            read[0].info_value("config_type"),
            Some(&InfoValue::Text("molecule".to_string()))
        );
    }

    #[test]
    fn malformed_line_reports_location() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.jsonl");
        std::fs::write(&path, "\n{not json}\n").unwrap();
        let err = JsonLinesIo.read(&path).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }
}
