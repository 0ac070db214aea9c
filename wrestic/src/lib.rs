pub mod args;
pub mod config;
pub mod error;
mod job;
pub mod kubernetes;
pub mod restic;
pub mod s3;
pub mod stats;

pub use error::{ResticError, Result};
pub use job::run;
