pub mod core;
pub mod directive;
pub mod geo;
pub mod query;
pub mod service;
pub mod setup_logger;
pub mod storage;
pub mod validation;

pub use crate::core::{Configuration, ErrorKind, RuleError, RuleResult};
pub use crate::service::RuleService;
pub use crate::storage::models::{OriginType, RuleAction, RuleRecord};
