pub mod constants;
pub mod controller;
pub mod error;
pub mod event;
pub mod machinery;
pub mod operator;
pub mod resources;
pub mod settings;
pub mod utils;
