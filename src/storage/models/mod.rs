pub mod rule;

pub use rule::{NewRule, OriginType, RuleAction, RuleRecord};
