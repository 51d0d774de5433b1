pub mod config;
pub mod errors;
pub mod run;
pub mod scoring;

pub use config::*;
pub use errors::*;
pub use run::*;
pub use scoring::*;
