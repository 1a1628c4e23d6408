//! Library load tracking.
//!
//! Remembers which units the remote host already holds so the same code is
//! never transferred twice in one session.

use crate::{BridgeError, Result};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// Set of unit names already delivered to the remote host.
#[derive(Debug, Default)]
pub struct LibraryLoadTracker {
    loaded: Mutex<BTreeSet<String>>,
}

impl LibraryLoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<String>>> {
        self.loaded
            .lock()
            .map_err(|_| BridgeError::poisoned("loaded units"))
    }

    /// Names from `required` the remote host does not have yet.
    pub fn missing(&self, required: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let loaded = self.lock()?;
        Ok(required.difference(&loaded).cloned().collect())
    }

    pub fn mark_loaded<I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        self.lock()?.extend(names);
        Ok(())
    }

    /// Forget everything except `units`.
    pub fn reset_to(&self, units: &BTreeSet<String>) -> Result<()> {
        *self.lock()? = units.clone();
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn snapshot(&self) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.clone())
    }
}
