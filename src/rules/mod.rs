//! Forwarding rules: configuration, compilation and matching.
//!
//! Rules are compiled once at load time (`book`), evaluated per message
//! (`matcher`), and never mutated by the relay.

pub mod book;
pub mod matcher;
pub mod model;

pub use book::{RuleBook, RuleStore};
pub use matcher::{Route, find_route, select_routes, should_forward};
pub use model::{
    DeliveryFlags, DeliveryMode, Destination, LinkPolicy, Rule, RuleSpec, RuleStatus,
    SourceProfile, SubmatchRule, SubmatchSpec,
};
