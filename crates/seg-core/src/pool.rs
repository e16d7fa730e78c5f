//! Process-wide model pool.
//!
//! Models are loaded lazily, exactly once, and never evicted before
//! `clear()`. Lookups of already-loaded models take a read lock only;
//! first-loads serialize on a per-mode mutex and re-check the cache before
//! loading, so concurrent first-calls coalesce into a single load and every
//! waiter observes the finished model.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tch::{Device, TchError};
use tracing::{debug, info};

use crate::mode::ModelMode;
use crate::model::SegModel;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to load {mode} model from {path}: {source}")]
    Load {
        mode: ModelMode,
        path: PathBuf,
        source: TchError,
    },
    #[error("model pool lock poisoned")]
    Poisoned,
}

pub struct ModelPool {
    model_dir: PathBuf,
    device: Device,
    fp16: bool,
    models: RwLock<HashMap<ModelMode, Arc<SegModel>>>,
    warm: RwLock<HashSet<ModelMode>>,
    load_slots: [Mutex<()>; 4],
    warm_slots: [Mutex<()>; 4],
}

impl ModelPool {
    pub fn new(model_dir: impl Into<PathBuf>, device: Device, fp16: bool) -> Self {
        Self {
            model_dir: model_dir.into(),
            device,
            fp16,
            models: RwLock::new(HashMap::new()),
            warm: RwLock::new(HashSet::new()),
            load_slots: [const { Mutex::new(()) }; 4],
            warm_slots: [const { Mutex::new(()) }; 4],
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn fp16(&self) -> bool {
        self.fp16
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Return the model for `mode`, loading it on first call.
    ///
    /// The load itself runs outside the map locks; callers racing on the same
    /// mode block on the per-mode slot and pick up the cached result.
    pub fn get(&self, mode: ModelMode) -> Result<Arc<SegModel>, PoolError> {
        if let Some(model) = self.lookup(mode)? {
            return Ok(model);
        }

        let _slot = self.load_slots[mode.index()]
            .lock()
            .map_err(|_| PoolError::Poisoned)?;
        if let Some(model) = self.lookup(mode)? {
            return Ok(model);
        }

        info!("loading {mode} model ({})", mode.profile().name);
        let model = SegModel::load(&self.model_dir, mode, self.device, self.fp16).map_err(
            |source| PoolError::Load {
                mode,
                path: self.model_dir.join(mode.profile().file),
                source,
            },
        )?;
        let model = Arc::new(model);
        self.models
            .write()
            .map_err(|_| PoolError::Poisoned)?
            .insert(mode, model.clone());
        info!("{mode} model ready on {:?}", self.device);
        Ok(model)
    }

    fn lookup(&self, mode: ModelMode) -> Result<Option<Arc<SegModel>>, PoolError> {
        Ok(self
            .models
            .read()
            .map_err(|_| PoolError::Poisoned)?
            .get(&mode)
            .cloned())
    }

    pub fn is_loaded(&self, mode: ModelMode) -> bool {
        self.models
            .read()
            .map(|models| models.contains_key(&mode))
            .unwrap_or(false)
    }

    pub fn is_warm(&self, mode: ModelMode) -> bool {
        self.warm
            .read()
            .map(|warm| warm.contains(&mode))
            .unwrap_or(false)
    }

    /// Record that `mode` has been warmed up. Ignored unless the mode is
    /// loaded, preserving warm ⊆ loaded.
    pub fn mark_warm(&self, mode: ModelMode) {
        let Ok(models) = self.models.read() else {
            return;
        };
        if !models.contains_key(&mode) {
            debug!("ignoring warm mark for unloaded mode {mode}");
            return;
        }
        if let Ok(mut warm) = self.warm.write() {
            warm.insert(mode);
        }
    }

    /// Per-mode mutex serializing warm-up runs so exactly one session pays
    /// the synthetic forward passes for a mode.
    pub fn warm_slot(&self, mode: ModelMode) -> &Mutex<()> {
        &self.warm_slots[mode.index()]
    }

    /// Drop every loaded model and reset the warm set.
    ///
    /// Holds the map write lock across both so a racing `get` sees either the
    /// fully populated or the fully cleared pool.
    pub fn clear(&self) {
        let Ok(mut models) = self.models.write() else {
            return;
        };
        if let Ok(mut warm) = self.warm.write() {
            warm.clear();
        }
        let evicted = models.len();
        models.clear();
        if evicted > 0 {
            info!("model pool cleared ({evicted} model(s) evicted)");
        }
    }

    pub fn loaded_modes(&self) -> Vec<ModelMode> {
        self.models
            .read()
            .map(|models| {
                let mut modes: Vec<ModelMode> = models.keys().copied().collect();
                modes.sort_by_key(|mode| mode.index());
                modes
            })
            .unwrap_or_default()
    }
}
