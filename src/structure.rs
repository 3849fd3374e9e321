use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::elements;
use crate::error::AtomsError;

pub const NUMBERS: &str = "numbers";
pub const POSITIONS: &str = "positions";

/// A per-structure property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
}

impl InfoValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InfoValue::Float(value) => Some(*value),
            InfoValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            InfoValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            InfoValue::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Canonical text form, used to group structures by value.
    pub fn group_key(&self) -> String {
        match self {
            InfoValue::Bool(value) => format!("bool:{value}"),
            InfoValue::Int(value) => format!("int:{value}"),
            InfoValue::Float(value) => format!("float:{value:?}"),
            InfoValue::Text(value) => format!("text:{value}"),
            InfoValue::IntVec(values) => format!("ints:{values:?}"),
            InfoValue::FloatVec(values) => format!("floats:{values:?}"),
        }
    }
}

impl From<bool> for InfoValue {
    fn from(value: bool) -> Self {
        InfoValue::Bool(value)
    }
}

impl From<i64> for InfoValue {
    fn from(value: i64) -> Self {
        InfoValue::Int(value)
    }
}

impl From<i32> for InfoValue {
    fn from(value: i32) -> Self {
        InfoValue::Int(value.into())
    }
}

impl From<usize> for InfoValue {
    fn from(value: usize) -> Self {
        InfoValue::Int(value as i64)
    }
}

impl From<f64> for InfoValue {
    fn from(value: f64) -> Self {
        InfoValue::Float(value)
    }
}

impl From<&str> for InfoValue {
    fn from(value: &str) -> Self {
        InfoValue::Text(value.to_string())
    }
}

impl From<String> for InfoValue {
    fn from(value: String) -> Self {
        InfoValue::Text(value)
    }
}

impl From<Vec<f64>> for InfoValue {
    fn from(value: Vec<f64>) -> Self {
        InfoValue::FloatVec(value)
    }
}

impl From<Vec<i64>> for InfoValue {
    fn from(value: Vec<i64>) -> Self {
        InfoValue::IntVec(value)
    }
}

/// A per-atom property: one row of `width` values per atom, stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AtomArray {
    Float { values: Vec<f64>, width: usize },
    Int { values: Vec<i64>, width: usize },
    Bool { values: Vec<bool>, width: usize },
    Text { values: Vec<String> },
}

impl AtomArray {
    pub fn scalars(values: Vec<f64>) -> Self {
        AtomArray::Float { values, width: 1 }
    }

    pub fn vectors(rows: &[[f64; 3]]) -> Self {
        AtomArray::Float {
            values: rows.iter().flatten().copied().collect(),
            width: 3,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            AtomArray::Float { width, .. }
            | AtomArray::Int { width, .. }
            | AtomArray::Bool { width, .. } => *width,
            AtomArray::Text { .. } => 1,
        }
    }

    fn value_count(&self) -> usize {
        match self {
            AtomArray::Float { values, .. } => values.len(),
            AtomArray::Int { values, .. } => values.len(),
            AtomArray::Bool { values, .. } => values.len(),
            AtomArray::Text { values } => values.len(),
        }
    }

    /// Number of atoms (rows) covered by this array.
    pub fn rows(&self) -> usize {
        match self.width() {
            0 => 0,
            width => self.value_count() / width,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AtomArray::Float { .. } => "float",
            AtomArray::Int { .. } => "int",
            AtomArray::Bool { .. } => "bool",
            AtomArray::Text { .. } => "text",
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            AtomArray::Float { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            AtomArray::Int { values, .. } => Some(values),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), AtomsError> {
        let width = self.width();
        if width == 0 {
            return Err(AtomsError::InvalidStructure(
                "per-atom arrays need a width of at least 1".to_string(),
            ));
        }
        if self.value_count() % width != 0 {
            return Err(AtomsError::InvalidStructure(format!(
                "{} values do not fill rows of width {width}",
                self.value_count()
            )));
        }
        Ok(())
    }

    /// Concatenates arrays of the same kind and width along the atom axis.
    pub fn concat<'a, I>(parts: I) -> Result<AtomArray, AtomsError>
    where
        I: IntoIterator<Item = &'a AtomArray>,
    {
        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Ok(AtomArray::Float {
                values: Vec::new(),
                width: 1,
            });
        };
        let mut merged = first.clone();
        for part in parts {
            let mismatch = || {
                AtomsError::InvalidStructure(format!(
                    "cannot concatenate {} arrays of width {} with {} arrays of width {}",
                    first.kind(),
                    first.width(),
                    part.kind(),
                    part.width()
                ))
            };
            match (&mut merged, part) {
                (
                    AtomArray::Float { values, width },
                    AtomArray::Float {
                        values: more,
                        width: other,
                    },
                ) if *width == *other => values.extend_from_slice(more),
                (
                    AtomArray::Int { values, width },
                    AtomArray::Int {
                        values: more,
                        width: other,
                    },
                ) if *width == *other => values.extend_from_slice(more),
                (
                    AtomArray::Bool { values, width },
                    AtomArray::Bool {
                        values: more,
                        width: other,
                    },
                ) if *width == *other => values.extend_from_slice(more),
                (AtomArray::Text { values }, AtomArray::Text { values: more }) => {
                    values.extend(more.iter().cloned())
                }
                _ => return Err(mismatch()),
            }
        }
        Ok(merged)
    }
}

/// A single atomic configuration.
///
/// `arrays` always holds `numbers` (atomic numbers, width 1) and `positions`
/// (cartesian coordinates, width 3). Structures handed out by a paged dataset
/// are frozen: their `info` and `arrays` reject every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    info: BTreeMap<String, InfoValue>,
    arrays: BTreeMap<String, AtomArray>,
    cell: Option<[[f64; 3]; 3]>,
    pbc: [bool; 3],
    calculator: Option<BTreeMap<String, InfoValue>>,
    #[serde(skip)]
    frozen: bool,
}

impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
            && self.arrays == other.arrays
            && self.cell == other.cell
            && self.pbc == other.pbc
            && self.calculator == other.calculator
    }
}

impl Structure {
    pub fn new(numbers: Vec<i64>, positions: &[[f64; 3]]) -> Result<Self, AtomsError> {
        if numbers.len() != positions.len() {
            return Err(AtomsError::InvalidStructure(format!(
                "{} atomic numbers but {} positions",
                numbers.len(),
                positions.len()
            )));
        }
        if let Some(bad) = numbers.iter().find(|z| elements::symbol(**z).is_none()) {
            return Err(AtomsError::InvalidStructure(format!(
                "unknown atomic number {bad}"
            )));
        }
        let mut arrays = BTreeMap::new();
        arrays.insert(
            NUMBERS.to_string(),
            AtomArray::Int {
                values: numbers,
                width: 1,
            },
        );
        arrays.insert(POSITIONS.to_string(), AtomArray::vectors(positions));
        Ok(Self {
            info: BTreeMap::new(),
            arrays,
            cell: None,
            pbc: [false; 3],
            calculator: None,
            frozen: false,
        })
    }

    pub fn from_symbols(symbols: &[&str], positions: &[[f64; 3]]) -> Result<Self, AtomsError> {
        let numbers = symbols
            .iter()
            .map(|symbol| {
                elements::atomic_number(symbol).ok_or_else(|| {
                    AtomsError::InvalidStructure(format!("unknown chemical symbol {symbol}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(numbers, positions)
    }

    pub fn with_cell(mut self, cell: [[f64; 3]; 3], pbc: [bool; 3]) -> Self {
        self.cell = Some(cell);
        self.pbc = pbc;
        self
    }

    pub fn len(&self) -> usize {
        self.numbers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numbers(&self) -> &[i64] {
        self.arrays
            .get(NUMBERS)
            .and_then(AtomArray::as_i64)
            .unwrap_or(&[])
    }

    pub fn positions(&self) -> &[f64] {
        self.arrays
            .get(POSITIONS)
            .and_then(AtomArray::as_f64)
            .unwrap_or(&[])
    }

    pub fn symbols(&self) -> Vec<&'static str> {
        self.numbers()
            .iter()
            .map(|z| elements::symbol(*z).unwrap_or("X"))
            .collect()
    }

    pub fn cell(&self) -> Option<&[[f64; 3]; 3]> {
        self.cell.as_ref()
    }

    pub fn pbc(&self) -> [bool; 3] {
        self.pbc
    }

    pub fn info(&self) -> &BTreeMap<String, InfoValue> {
        &self.info
    }

    pub fn arrays(&self) -> &BTreeMap<String, AtomArray> {
        &self.arrays
    }

    pub fn info_value(&self, key: &str) -> Option<&InfoValue> {
        self.info.get(key)
    }

    pub fn array(&self, key: &str) -> Option<&AtomArray> {
        self.arrays.get(key)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn freeze(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// An independent, mutable copy of this structure.
    pub fn thawed(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }

    pub fn set_info(
        &mut self,
        key: impl Into<String>,
        value: impl Into<InfoValue>,
    ) -> Result<(), AtomsError> {
        self.ensure_mutable("info")?;
        self.info.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove_info(&mut self, key: &str) -> Result<Option<InfoValue>, AtomsError> {
        self.ensure_mutable("info")?;
        Ok(self.info.remove(key))
    }

    pub fn set_array(
        &mut self,
        key: impl Into<String>,
        array: AtomArray,
    ) -> Result<(), AtomsError> {
        self.ensure_mutable("arrays")?;
        let key = key.into();
        array.validate()?;
        if array.rows() != self.len() {
            return Err(AtomsError::InvalidStructure(format!(
                "array {key} has {} rows but the structure has {} atoms",
                array.rows(),
                self.len()
            )));
        }
        if key == NUMBERS && (array.as_i64().is_none() || array.width() != 1) {
            return Err(AtomsError::InvalidStructure(
                "numbers must be a width-1 integer array".to_string(),
            ));
        }
        if key == POSITIONS && (array.as_f64().is_none() || array.width() != 3) {
            return Err(AtomsError::InvalidStructure(
                "positions must be a width-3 float array".to_string(),
            ));
        }
        self.arrays.insert(key, array);
        Ok(())
    }

    pub fn remove_array(&mut self, key: &str) -> Result<Option<AtomArray>, AtomsError> {
        self.ensure_mutable("arrays")?;
        if key == NUMBERS || key == POSITIONS {
            return Err(AtomsError::InvalidStructure(format!(
                "{key} cannot be removed from a structure"
            )));
        }
        Ok(self.arrays.remove(key))
    }

    pub fn calculator_results(&self) -> Option<&BTreeMap<String, InfoValue>> {
        self.calculator.as_ref()
    }

    /// Attaches a computed result (e.g. from a calculator) that is not part
    /// of the structure's persistent metadata.
    pub fn attach_calculator_result(
        &mut self,
        key: impl Into<String>,
        value: impl Into<InfoValue>,
    ) -> Result<(), AtomsError> {
        self.ensure_mutable("info")?;
        self.calculator
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        Ok(())
    }

    pub fn strip_calculator(&mut self) {
        self.calculator = None;
    }

    fn ensure_mutable(&self, attribute: &'static str) -> Result<(), AtomsError> {
        if self.frozen {
            return Err(AtomsError::ReadOnly { attribute });
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), AtomsError> {
        let atoms = self.len();
        for (key, array) in &self.arrays {
            array.validate()?;
            if array.rows() != atoms {
                return Err(AtomsError::InvalidStructure(format!(
                    "array {key} has {} rows but the structure has {atoms} atoms",
                    array.rows()
                )));
            }
        }
        if !self.arrays.contains_key(NUMBERS) || !self.arrays.contains_key(POSITIONS) {
            return Err(AtomsError::InvalidStructure(
                "structures must define numbers and positions".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn water() -> Structure {
        Structure::from_symbols(
            &["O", "H", "H"],
            &[[0.0, 0.0, 0.0], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]],
        )
        .unwrap()
    }

    #[test]
    fn build_from_symbols() {
        let structure = water();
        assert_eq!(structure.len(), 3);
        assert_eq!(structure.numbers(), &[8, 1, 1]);
        assert_eq!(structure.symbols(), vec!["O", "H", "H"]);
        assert_eq!(structure.positions().len(), 9);
        assert!(structure.arrays().contains_key(NUMBERS));
        assert!(structure.arrays().contains_key(POSITIONS));
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let err = Structure::new(vec![1, 1], &[[0.0; 3]]).unwrap_err();
        assert_matches!(err, AtomsError::InvalidStructure(_));
    }

    #[test]
    fn array_rows_must_match_atoms() {
        let mut structure = water();
        let err = structure
            .set_array("forces", AtomArray::vectors(&[[0.0; 3]; 2]))
            .unwrap_err();
        assert_matches!(err, AtomsError::InvalidStructure(_));
        structure
            .set_array("forces", AtomArray::vectors(&[[0.0; 3]; 3]))
            .unwrap();
        assert_eq!(structure.array("forces").unwrap().rows(), 3);
    }

    #[test]
    fn frozen_structures_reject_mutation() {
        let mut frozen = water().freeze();
        assert_matches!(
            frozen.set_info("energy", 1.0),
            Err(AtomsError::ReadOnly { attribute: "info" })
        );
        assert_matches!(
            frozen.set_array("charges", AtomArray::scalars(vec![0.0; 3])),
            Err(AtomsError::ReadOnly { attribute: "arrays" })
        );
        assert!(frozen.info().is_empty());

        let mut thawed = frozen.thawed();
        thawed.set_info("energy", 1.0).unwrap();
        assert_eq!(thawed.info_value("energy"), Some(&InfoValue::Float(1.0)));
    }

    #[test]
    fn concat_checks_kind_and_width() {
        let a = AtomArray::vectors(&[[1.0, 2.0, 3.0]]);
        let b = AtomArray::vectors(&[[4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let merged = AtomArray::concat([&a, &b]).unwrap();
        assert_eq!(merged.rows(), 3);

        let c = AtomArray::scalars(vec![1.0]);
        assert!(AtomArray::concat([&a, &c]).is_err());
    }

    #[test]
    fn strip_calculator_results() {
        let mut structure = water();
        structure.attach_calculator_result("energy", -10.0).unwrap();
        assert!(structure.calculator_results().is_some());
        structure.strip_calculator();
        assert!(structure.calculator_results().is_none());
    }
}
