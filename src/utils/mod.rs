pub mod naming;
pub mod time;
pub mod tracing;
