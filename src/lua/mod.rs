pub mod capture;
pub mod convert;
pub mod sandbox;
pub mod worker;

pub use worker::{LuaWorker, LuaWorkerFactory};
