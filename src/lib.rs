pub mod config;
pub mod constants;
pub mod core;
pub mod lua;
pub mod runtime;

#[cfg(test)]
mod stubs;

pub use crate::config::RuntimeConfig;
pub use crate::core::domain::{
    BatchSummary, ErrorKind, ExecutionRequest, ExecutionResult, RuntimeInfo, RuntimeStatus,
    TestCase, TestCaseResult, TestStatus,
};
pub use crate::runtime::{EngineError, RunOptions, Runtime, Subscription};
