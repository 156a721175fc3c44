//! Turn orchestration: the controller plus the pieces it drives.

pub mod best_seen;
pub mod controller;
pub mod guard;
pub mod retry;
pub mod tools;

pub use best_seen::{BestSeen, Candidate};
pub use controller::{PipelineController, TurnResult, quality_score};
pub use retry::RetryFailureContext;
pub use tools::{BatchOutcome, SkipReason, ToolCoordinator, ToolLedger, ToolOutcome};

/// Controller states recorded in the document header.
pub use crate::document::PhaseKind as PipelineState;
