pub mod coordinator;
pub mod job;
pub mod service;
pub mod stats;

pub use coordinator::{CoordinatorConfig, IngestionCoordinator};
pub use service::{CandleIngestionService, IngestionConfig};
