pub mod change_detector;
pub mod classifier;
pub mod config;
pub mod deduplicator;
pub mod error;
pub mod frame;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod scheduler;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testing;

pub use change_detector::{ChangeConfig, ChangeDetector, ObjectState};
pub use classifier::{ClassificationResult, Classifier, Prediction, CARD_CLASSES};
pub use config::PipelineConfig;
pub use deduplicator::ResultDeduplicator;
pub use error::{ErrorKind, PipelineError};
pub use frame::{BoundingBox, DetectedObject, Frame, FrameSource, ObjectDetector, ResultSink};
pub use model::{LoaderKind, ModelCandidate, ModelHandle};
pub use pipeline::{CardPipeline, CycleOptions, CycleOutcome, PipelineStats, PipelineStatus, SkipReason};
pub use scheduler::CaptureLoop;
