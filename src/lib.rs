pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod run;
pub mod state;

pub use error::{Error, Result};
