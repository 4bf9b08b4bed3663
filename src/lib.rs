pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
