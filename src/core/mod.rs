pub mod config;
pub mod error;

pub use config::Configuration;
pub use error::{ErrorKind, RuleError, RuleResult};
