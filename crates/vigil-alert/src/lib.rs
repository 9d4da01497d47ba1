//! Rule evaluation and alert detection.
//!
//! Rules pair a [`condition::RuleCondition`] tree with an ordered list of
//! [`rule::RuleAction`]s. The [`engine::RuleEngine`] evaluates every enabled rule
//! whose event pattern matches an incoming [`vigil_common::types::Event`] and
//! returns the rules that triggered; [`detect::AlertDetector`] turns a triggered
//! rule into an immutable [`vigil_common::types::Alert`].

pub mod condition;
pub mod detect;
pub mod engine;
pub mod error;
pub mod rule;
