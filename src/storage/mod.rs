pub mod atomic_write;
pub mod file_store;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod sql_store;

pub use file_store::FileRuleStore;
pub use repository::RuleRepository;
pub use sql_store::SqlRuleStore;
