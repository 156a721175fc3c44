pub mod approval;
pub mod claims;
pub mod config;
pub mod document;
pub mod errors;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod strategy;
pub mod text;
pub mod util;

pub use config::TurnflowConfig;
pub use document::WorkingDocument;
pub use errors::{DocumentError, IndexError, PipelineError, StoreError};
pub use pipeline::{PipelineController, TurnResult};
pub use strategy::Strategies;
