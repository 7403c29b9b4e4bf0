pub mod persist;
pub mod pipeline;
