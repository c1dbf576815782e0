use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use log::{debug, error, info, warn};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use super::change_detector::{ChangeDetector, ObjectState};
use super::classifier::{ClassificationResult, Classifier};
use super::config::PipelineConfig;
use super::deduplicator::ResultDeduplicator;
use super::error::{ModelLoadError, PipelineError, PreprocessError};
use super::frame::{DetectedObject, Frame, FrameSource, ObjectDetector, ResultSink};
use super::model::{self, ModelCandidate, ModelHandle};
use super::preprocess::{self, Preprocessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    ModelUnavailable,
    NoChange,
    Duplicate,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Classified(ClassificationResult),
    Skipped(SkipReason),
    Failed(PipelineError),
}

impl CycleOutcome {
    pub fn result(&self) -> Option<&ClassificationResult> {
        match self {
            CycleOutcome::Classified(r) => Some(r),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            CycleOutcome::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// 手动拍照不做变化门控，自动模式做
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOptions {
    pub gate_on_change: bool,
}

impl CycleOptions {
    pub fn manual() -> Self {
        Self { gate_on_change: false }
    }

    pub fn periodic() -> Self {
        Self { gate_on_change: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    Loading,
    Ready,
    Failed(String),
}

enum ModelSlot {
    Loading,
    Ready(Arc<ModelHandle>),
    Failed(String),
}

/// State carried across cycles. Held behind the pipeline's single-slot lock,
/// so holding it is the in-flight guard.
#[derive(Debug, Default)]
pub struct PipelineState {
    last_objects: Option<ObjectState>,
    dedup: ResultDeduplicator,
}

impl PipelineState {
    pub fn last_objects(&self) -> Option<&ObjectState> {
        self.last_objects.as_ref()
    }

    pub fn last_label(&self) -> Option<&str> {
        self.dedup.last_label()
    }

    fn reset(&mut self) {
        self.last_objects = None;
        self.dedup.reset();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cycles: u64,
    pub classified: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct CardPipeline {
    config: PipelineConfig,
    change_detector: ChangeDetector,
    preprocessor: Preprocessor,
    pool: Arc<ThreadPool>,
    classifier: Classifier,
    model: RwLock<ModelSlot>,
    state: Mutex<PipelineState>,
    stats: Mutex<PipelineStats>,
}

impl CardPipeline {
    pub fn new() -> Result<Self, PreprocessError> {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Result<Self, PreprocessError> {
        let pool = preprocess::build_pool(config.worker_threads)?;
        Ok(Self {
            change_detector: ChangeDetector::with_config(config.change.clone()),
            preprocessor: Preprocessor::with_pool(Arc::clone(&pool)),
            pool,
            classifier: Classifier::with_top_k(config.top_k),
            model: RwLock::new(ModelSlot::Loading),
            state: Mutex::new(PipelineState::default()),
            stats: Mutex::new(PipelineStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> PipelineStatus {
        match &*self.model.read().unwrap_or_else(|e| e.into_inner()) {
            ModelSlot::Loading => PipelineStatus::Loading,
            ModelSlot::Ready(_) => PipelineStatus::Ready,
            ModelSlot::Failed(reason) => PipelineStatus::Failed(reason.clone()),
        }
    }

    pub fn model(&self) -> Option<Arc<ModelHandle>> {
        match &*self.model.read().unwrap_or_else(|e| e.into_inner()) {
            ModelSlot::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    fn set_model(&self, slot: ModelSlot) {
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = slot;
    }

    /// Resolves a model from `candidates` with the configured strategies.
    /// On failure the pipeline stays unavailable until a new load succeeds.
    pub fn load_model(&self, candidates: &[ModelCandidate]) -> Result<(), ModelLoadError> {
        self.set_model(ModelSlot::Loading);
        match model::load_model(candidates, &self.config.strategies) {
            Ok(handle) => {
                self.install_model(handle);
                Ok(())
            }
            Err(e) => {
                self.set_model(ModelSlot::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn load_from_dir(&self, dir: &Path) -> Result<(), ModelLoadError> {
        info!("📂 Loading bundled model from {:?}", dir);
        match model::discover_candidates(dir) {
            Ok(candidates) => self.load_model(&candidates),
            Err(e) => {
                let err = ModelLoadError {
                    exhausted_candidates: 0,
                    last_error: e.to_string(),
                };
                error!("❌ Model discovery failed: {}", err);
                self.set_model(ModelSlot::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn install_model(&self, handle: ModelHandle) {
        info!(
            "✅ Pipeline ready: {} model from {}",
            handle.kind().name(),
            handle.candidate()
        );
        self.set_model(ModelSlot::Ready(Arc::new(handle)));
    }

    /// Runs one cycle on an already captured frame. Returns `Skipped` at once
    /// when another cycle holds the pipeline.
    pub fn run_cycle(
        &self,
        frame: &Frame,
        detections: Option<&[DetectedObject]>,
        options: CycleOptions,
    ) -> CycleOutcome {
        let outcome = match self.try_begin() {
            Some(mut state) => self.run_locked(&mut state, frame, detections, options),
            None => CycleOutcome::Skipped(SkipReason::InFlight),
        };
        self.record(&outcome);
        outcome
    }

    /// Full capture cycle: FrameSource -> optional detector -> classify -> sink.
    pub fn capture_and_run(
        &self,
        source: &dyn FrameSource,
        detector: Option<&dyn ObjectDetector>,
        sink: &dyn ResultSink,
        options: CycleOptions,
    ) -> CycleOutcome {
        let outcome = match self.try_begin() {
            None => CycleOutcome::Skipped(SkipReason::InFlight),
            Some(_) if self.model().is_none() => CycleOutcome::Skipped(SkipReason::ModelUnavailable),
            Some(mut state) => match source.capture_frame() {
                Ok(frame) => {
                    let detections = detector.map(|d| d.detect(&frame.bytes));
                    self.run_locked(&mut state, &frame, detections.as_deref(), options)
                }
                Err(e) => CycleOutcome::Failed(e.into()),
            },
        };

        match &outcome {
            CycleOutcome::Classified(result) => sink.on_result(result),
            CycleOutcome::Failed(e) => sink.on_error(e.kind(), &e.to_string()),
            CycleOutcome::Skipped(reason) => debug!("⏭️ Cycle skipped: {:?}", reason),
        }
        self.record(&outcome);
        outcome
    }

    /// Clears the last reported label and object snapshot, e.g. when the
    /// capture direction or auto mode is toggled.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reset();
        info!("🔄 Pipeline state reset");
    }

    pub fn last_label(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_label().map(str::to_string)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn try_begin(&self) -> Option<MutexGuard<'_, PipelineState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("⚠️ Pipeline state lock poisoned, recovering");
                Some(poisoned.into_inner())
            }
        }
    }

    fn run_locked(
        &self,
        state: &mut PipelineState,
        frame: &Frame,
        detections: Option<&[DetectedObject]>,
        options: CycleOptions,
    ) -> CycleOutcome {
        let Some(model) = self.model() else {
            return CycleOutcome::Skipped(SkipReason::ModelUnavailable);
        };

        if options.gate_on_change {
            if let Some(objects) = detections {
                let decision = self.change_detector.has_changed(objects, state.last_objects.as_ref());
                if !decision.changed {
                    return CycleOutcome::Skipped(SkipReason::NoChange);
                }
                debug!("📐 Scene changed: {} object(s)", decision.state.count);
                state.last_objects = Some(decision.state);
            }
        }

        let tensor = match self.preprocessor.preprocess_for(&model, &frame.bytes) {
            Ok(t) => t,
            Err(e) => {
                warn!("⚠️ Frame @{}ms skipped: {}", frame.timestamp_ms(), e);
                return CycleOutcome::Failed(e.into());
            }
        };

        let result = match self.pool.install(|| self.classifier.classify(&model, tensor)) {
            Ok(r) => r,
            Err(e) => {
                error!("❌ Classification failed: {}", e);
                return CycleOutcome::Failed(e.into());
            }
        };

        if !state.dedup.should_report(&result.label) {
            return CycleOutcome::Skipped(SkipReason::Duplicate);
        }
        state.dedup.update(&result.label);
        info!("🃏 Recognized {} ({:.2}%)", result.label, result.confidence);
        CycleOutcome::Classified(result)
    }

    fn record(&self, outcome: &CycleOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.cycles += 1;
            match outcome {
                CycleOutcome::Classified(_) => stats.classified += 1,
                CycleOutcome::Skipped(_) => stats.skipped += 1,
                CycleOutcome::Failed(_) => stats.failed += 1,
            }
        }
    }
}

impl Drop for CardPipeline {
    fn drop(&mut self) {
        info!("🗑️ CardPipeline: releasing model and worker pool");
    }
}
