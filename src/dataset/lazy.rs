use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AtomsError;

type Cell<T> = Arc<Mutex<Option<Option<Arc<T>>>>>;

/// Per-key memoised values. Concurrent first accesses of one key compute it
/// once; the others wait on that key's cell. Failures are not cached.
pub(crate) struct LazyColumns<T> {
    cells: Mutex<HashMap<String, Cell<T>>>,
}

impl<T> LazyColumns<T> {
    pub(crate) fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_compute<F>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<Option<Arc<T>>, AtomsError>
    where
        F: FnOnce() -> Result<Option<T>, AtomsError>,
    {
        let cell = self
            .cells
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut slot = cell.lock();
        if let Some(value) = slot.as_ref() {
            return Ok(value.clone());
        }
        let value = compute()?.map(Arc::new);
        *slot = Some(value.clone());
        Ok(value)
    }
}

/// A single memoised value with the same contract as [`LazyColumns`].
pub(crate) struct LazyValue<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> LazyValue<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn get_or_compute<F>(&self, compute: F) -> Result<Arc<T>, AtomsError>
    where
        F: FnOnce() -> Result<T, AtomsError>,
    {
        let mut slot = self.slot.lock();
        if let Some(value) = slot.as_ref() {
            return Ok(value.clone());
        }
        let value = Arc::new(compute()?);
        *slot = Some(value.clone());
        Ok(value)
    }
}
