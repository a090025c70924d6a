pub mod id;
pub mod tracing;
