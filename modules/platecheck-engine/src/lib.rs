//! Orchestration for platecheck: the interactive analysis pipeline, the
//! coalescing task queue, and bulk discovery/analysis runs.

pub mod analyze;
pub mod bulk;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod tasks;

pub use analyze::{AnalysisOutcome, AnalyzeOptions, Analyzer};
pub use bulk::{
    AnalysisReport, AnalysisRunOptions, BoundingBox, BulkOrchestrator, DiscoveryOptions,
    DiscoveryReport, RegionFilter,
};
pub use error::{EngineError, Result};
pub use gateway::{CallError, Gateway, ModelAnalyst, PlaceSearcher, ReviewAnalyst, ReviewScraper};
pub use tasks::{TaskQueue, TaskRecord, TaskState};
