#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod chunking;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod filtering;
pub mod flatten;
pub mod merge;
pub mod model;
pub mod navigator;
pub mod notify;
pub mod overlay;
pub mod settings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use error::Error;
