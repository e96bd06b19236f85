pub mod domain;
pub mod interrupt;
pub mod pipeline;
pub mod traits;
