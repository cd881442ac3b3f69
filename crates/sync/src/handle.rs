use std::sync::{Arc, Weak};

/// A non-owning handle to the database a background subsystem reports to.
///
/// Background threads must never extend the database's lifetime, so every
/// use goes through [`DbHandle::get`] and copes with the database being gone.
pub struct DbHandle<D: ?Sized>(Weak<D>);

impl<D: ?Sized> DbHandle<D> {
    pub fn new(db: &Arc<D>) -> Self {
        Self(Arc::downgrade(db))
    }

    /// A strong reference for the duration of one operation, or `None` if
    /// the database has already been dropped.
    pub fn get(&self) -> Option<Arc<D>> {
        self.0.upgrade()
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl<D: ?Sized> From<Weak<D>> for DbHandle<D> {
    fn from(weak: Weak<D>) -> Self {
        Self(weak)
    }
}

impl<D: ?Sized> Clone for DbHandle<D> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}
