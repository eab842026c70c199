//! Recordings already handed to the download pipeline.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

/// Append-only set of recording identifiers, shared by cheap clones.
///
/// Lives for the process lifetime only.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains(id)
    }

    /// Returns `true` if the id was not present before.
    pub fn insert(&self, id: impl Into<String>) -> bool {
        self.inner.write().insert(id.into())
    }

    pub fn extend<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.write();
        inner.extend(ids.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
