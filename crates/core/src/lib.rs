// Core types and execution machinery for the Conveyor CI/CD orchestrator

pub mod clock;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod policy;
pub mod storage;
pub mod types;
pub mod workflow;

pub use clock::{Clock, SystemClock};
pub use error::{DagError, EngineError, ServiceError, ServiceResult, TaskError};
pub use events::{LoggingObserver, TaskObserver, TaskUpdate, UpdateSink};
pub use orchestrator::WorkflowService;
pub use policy::ExecutionPolicy;
pub use types::*;
