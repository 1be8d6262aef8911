//! Quantization algorithms built on the shared parameter solver.

mod rtn;
mod teq;
mod train;

pub use rtn::{RtnOutcome, RtnQuantizer, SkipReason, solve};
pub use teq::{AbsorptionGroup, TeqStage, TrainReport, TrainableEquivalentTransformation};
pub use train::{CalibrationBatch, CalibrationSource, LrSchedulerType, TrainConfig};
