//! Shared, atomically swappable body model.
//!
//! Tracking reads the current model once per frame by cloning the inner
//! `Arc`; calibration publishes a finished model by replacing it whole. A
//! reader therefore sees either the old or the new model, never a mix.

use std::sync::Arc;

use parking_lot::RwLock;

use super::BodyModel;

#[derive(Debug, Clone)]
pub struct BodyModelHandle {
    current: Arc<RwLock<Arc<BodyModel>>>,
}

impl BodyModelHandle {
    pub fn new(model: BodyModel) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(model))),
        }
    }

    /// Snapshot of the current model.
    pub fn load(&self) -> Arc<BodyModel> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new model, returning the one it replaces.
    pub fn swap(&self, model: BodyModel) -> Arc<BodyModel> {
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, Arc::new(model))
    }
}
