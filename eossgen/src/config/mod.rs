pub mod config;
pub mod error;
pub mod size;

pub use config::*;
pub use error::*;
pub use size::*;
