pub mod api;
pub mod informer;
pub mod local;
pub mod store;
