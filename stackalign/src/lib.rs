//! Stackalign - serial-section stack alignment engine.
//!
//! Registers every section of an ordered image stack to its nearest included
//! predecessor, folds the pairwise affines into one global frame and removes
//! slowly varying drift from the result.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stackalign::{AlignOptions, AlignmentDriver, CancelToken, ProcessRunner, ResultCache, Stack, TaskQueue};
//!
//! let mut stack = Stack::load("stack.yaml".as_ref())?;
//! let runner = ProcessRunner::new("stackalign").with_args(["run-task"]);
//! let mut driver = AlignmentDriver::new(TaskQueue::new(runner, Default::default()), ResultCache::in_memory());
//! let report = driver
//!     .align(&mut stack, &AlignOptions::new(4), &CancelToken::new(), &stackalign::no_progress())
//!     .await?;
//! println!("{} sections aligned", report.succeeded.len());
//! ```

pub mod affine;
pub mod bias;
pub mod cache;
pub mod config;
pub mod cumulative;
pub mod diagnostics;
pub mod driver;
pub mod primitive;
pub mod recipe;
pub mod settings;
pub mod stack;
pub mod task;
pub mod task_queue;

#[cfg(test)]
pub(crate) mod test_utils;

// ============================================================================
// Geometry
// ============================================================================

pub use affine::{AffineComponents, AffineError, AffineMatrix, PointPair};
pub use cumulative::{compose_chain, ChainLink};

// ============================================================================
// Stack model and configuration
// ============================================================================

pub use config::{AlignOptions, BiasConfig, EngineConfig, PrimitiveConfig, QueueConfig};
pub use settings::{LevelSettings, Method, SettingsError, TaskSettings};
pub use stack::{AlignResults, Section, Stack, StackError};

// ============================================================================
// Alignment
// ============================================================================

pub use bias::{detrend, BiasReport};
pub use cache::{CacheError, CacheKey, Fingerprint, ResultCache};
pub use driver::{AlignReport, AlignmentDriver, DriverError, SectionFailure};
pub use primitive::{PrimitiveError, RegistrationPrimitive, SwimMirPrimitive};
pub use recipe::{Recipe, RecipeOutcome};
pub use task::{AlignTask, TaskResult};
pub use task_queue::{
    no_progress, BatchReport, CancelToken, InProcessRunner, ProcessRunner, ProgressSink,
    TaskFailure, TaskQueue, TaskRunner,
};
