pub mod batch;
pub mod matching;
