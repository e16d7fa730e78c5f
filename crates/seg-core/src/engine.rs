//! Per-session inference adapter.
//!
//! Each connection owns one engine. The engine borrows models from the shared
//! pool, runs frames through the active one, and keeps exponentially weighted
//! statistics of inference cost so a session can report smooth numbers
//! without unbounded history.

use std::sync::Arc;
use std::time::Instant;

use tch::{Kind, Tensor};
use tracing::{debug, info};

use crate::mode::ModelMode;
use crate::model::{ModelError, SegModel};
use crate::pool::{ModelPool, PoolError};
use crate::tensor::{postprocess, preprocess, ClassMap, Frame};

/// Smoothing factor for the rolling averages.
const EWMA_ALPHA: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("resource exhaustion during inference: {0}")]
    OutOfMemory(String),
}

impl EngineError {
    /// Split resource exhaustion out of the generic failure bucket; clients
    /// can recover from it by switching to a lighter mode.
    fn from_model(err: ModelError) -> Self {
        let message = err.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("out of memory") || lowered.contains("outofmemory") {
            EngineError::OutOfMemory(message)
        } else {
            EngineError::Inference(message)
        }
    }
}

/// Timing attached to every successful prediction.
#[derive(Debug, Clone, Copy)]
pub struct PredictMetadata {
    pub inference_time_ms: f64,
    pub total_time_ms: f64,
    pub fps: f64,
    pub avg_inference_ms: f64,
}

/// Rolling statistics snapshot for the stats endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub avg_inference_ms: f64,
    pub avg_fps: f64,
    pub frames: u64,
}

/// Exponentially weighted averages of inference time and frame time.
#[derive(Debug, Clone, Copy, Default)]
struct RollingStats {
    avg_inference_ms: f64,
    avg_total_ms: f64,
    frames: u64,
}

impl RollingStats {
    fn record(&mut self, inference_ms: f64, total_ms: f64) {
        if self.frames == 0 {
            self.avg_inference_ms = inference_ms;
            self.avg_total_ms = total_ms;
        } else {
            self.avg_inference_ms += EWMA_ALPHA * (inference_ms - self.avg_inference_ms);
            self.avg_total_ms += EWMA_ALPHA * (total_ms - self.avg_total_ms);
        }
        self.frames = self.frames.wrapping_add(1);
    }

    fn snapshot(self) -> StatsSnapshot {
        StatsSnapshot {
            avg_inference_ms: self.avg_inference_ms,
            avg_fps: if self.avg_total_ms > 0.0 {
                1000.0 / self.avg_total_ms
            } else {
                0.0
            },
            frames: self.frames,
        }
    }
}

pub struct InferenceEngine {
    pool: Arc<ModelPool>,
    mode: ModelMode,
    model: Option<Arc<SegModel>>,
    warmup_iterations: usize,
    stats: RollingStats,
}

impl InferenceEngine {
    pub fn new(pool: Arc<ModelPool>, warmup_iterations: usize) -> Self {
        Self {
            pool,
            mode: ModelMode::Balanced,
            model: None,
            warmup_iterations,
            stats: RollingStats::default(),
        }
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    /// Switch to `mode`, obtaining the model from the pool. A switch to the
    /// already-active mode leaves the current model untouched.
    pub fn set_mode(&mut self, mode: ModelMode) -> Result<(), EngineError> {
        if self.model.is_some() && mode == self.mode {
            return Ok(());
        }
        if self.model.is_some() {
            debug!("switching model from {} to {}", self.mode, mode);
        }
        let model = self.pool.get(mode)?;
        self.mode = mode;
        self.model = Some(model);
        Ok(())
    }

    fn active_model(&mut self) -> Result<Arc<SegModel>, EngineError> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }
        let model = self.pool.get(self.mode)?;
        self.model = Some(model.clone());
        Ok(model)
    }

    /// Run the warm-up forward passes for the active mode unless another
    /// session has already paid for them.
    ///
    /// Returns whether this call actually ran the passes. The per-mode slot
    /// in the pool serializes concurrent warm-ups, so across the whole
    /// process each mode is warmed exactly once.
    pub fn warm_up(&mut self, force: bool) -> Result<bool, EngineError> {
        let model = self.active_model()?;
        let slot = self.pool.warm_slot(self.mode);
        let _guard = slot.lock().map_err(|_| PoolError::Poisoned)?;
        if !force && self.pool.is_warm(self.mode) {
            return Ok(false);
        }

        info!("warming up {} model", self.mode);
        let (h, w) = self.mode.input_size();
        let kind = if model.fp16() { Kind::Half } else { Kind::Float };
        let dummy = Tensor::randn([1, 3, h, w], (kind, model.device()));
        for _ in 0..self.warmup_iterations {
            tch::no_grad(|| model.forward(&dummy)).map_err(EngineError::from_model)?;
        }
        self.pool.mark_warm(self.mode);
        info!("{} warm-up complete", self.mode);
        Ok(true)
    }

    /// Run one frame through the active model and return the class map at
    /// the frame's original resolution.
    pub fn predict(
        &mut self,
        frame: &Frame<'_>,
    ) -> Result<(ClassMap, PredictMetadata), EngineError> {
        let start = Instant::now();
        let model = self.active_model()?;

        let input = preprocess(
            frame,
            self.mode.input_size(),
            model.device(),
            model.fp16(),
        )
        .map_err(EngineError::from_model)?;

        let inference_start = Instant::now();
        let scores = tch::no_grad(|| model.forward(&input)).map_err(EngineError::from_model)?;
        let mask = scores.argmax(1, false).squeeze_dim(0);
        let inference_ms = inference_start.elapsed().as_secs_f64() * 1000.0;

        let map = postprocess(&mask, (frame.height, frame.width)).map_err(EngineError::from_model)?;
        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(inference_ms, total_ms);

        Ok((
            map,
            PredictMetadata {
                inference_time_ms: inference_ms,
                total_time_ms: total_ms,
                fps: if total_ms > 0.0 { 1000.0 / total_ms } else { 0.0 },
                avg_inference_ms: self.stats.avg_inference_ms,
            },
        ))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&mut self) {
        self.stats = RollingStats::default();
    }
}

#[cfg(test)]
mod tests {
    use tch::Device;

    use super::*;

    #[test]
    fn ewma_seeds_with_first_sample() {
        let mut stats = RollingStats::default();
        stats.record(40.0, 50.0);
        let snap = stats.snapshot();
        assert_eq!(snap.avg_inference_ms, 40.0);
        assert_eq!(snap.avg_fps, 20.0);
        assert_eq!(snap.frames, 1);
    }

    #[test]
    fn ewma_moves_a_tenth_towards_new_samples() {
        let mut stats = RollingStats::default();
        stats.record(100.0, 100.0);
        stats.record(200.0, 200.0);
        let snap = stats.snapshot();
        assert!((snap.avg_inference_ms - 110.0).abs() < 1e-9);
        assert!((snap.avg_fps - 1000.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_report_zero_fps() {
        let snap = RollingStats::default().snapshot();
        assert_eq!(snap.avg_fps, 0.0);
        assert_eq!(snap.frames, 0);
    }

    #[test]
    fn out_of_memory_is_classified_separately() {
        let oom = EngineError::from_model(ModelError::Output(
            "CUDA out of memory. Tried to allocate 2.00 GiB".to_string(),
        ));
        assert!(matches!(oom, EngineError::OutOfMemory(_)));

        let generic = EngineError::from_model(ModelError::Output("shape mismatch".to_string()));
        assert!(matches!(generic, EngineError::Inference(_)));
    }

    #[test]
    fn engine_starts_on_balanced_with_empty_stats() {
        let pool = Arc::new(ModelPool::new("/nonexistent", Device::Cpu, false));
        let engine = InferenceEngine::new(pool, 3);
        assert_eq!(engine.mode(), ModelMode::Balanced);
        assert_eq!(engine.stats().frames, 0);
    }

    #[test]
    fn set_mode_propagates_load_failures() {
        let pool = Arc::new(ModelPool::new("/nonexistent", Device::Cpu, false));
        let mut engine = InferenceEngine::new(pool, 3);
        assert!(matches!(
            engine.set_mode(ModelMode::Fast),
            Err(EngineError::Pool(_))
        ));
        // The failed switch must not leave a half-selected mode behind.
        assert_eq!(engine.mode(), ModelMode::Balanced);
    }
}
