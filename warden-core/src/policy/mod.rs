//! Action policy engine

pub mod engine;
pub mod rules;

pub use engine::{Decision, PolicyContext, PolicyEngine, PolicyRule, PolicyVerdict, RuleMatch};
pub use rules::{
    HighImpactActionRule, NewActionTypeRule, NonProductionRule, PrivateRangeProductionRule,
    ReservedTargetRule,
};
