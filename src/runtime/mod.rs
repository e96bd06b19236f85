pub mod errors;
pub mod orchestrator;
pub mod status;

pub use errors::EngineError;
pub use orchestrator::{RunOptions, Runtime};
pub use status::{StatusBoard, Subscription};
