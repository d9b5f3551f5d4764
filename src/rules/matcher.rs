//! Forwarding decision for a single rule, and destination selection across rules.
//!
//! Evaluation order for one rule:
//! 1. inactive rule → drop
//! 2. `exclude` matches → drop (exclude always wins)
//! 3. `include` set but does not match → drop
//! 4. submatch filters, in order; the first in-range capture outside its
//!    allowed set drops the message, out-of-range or non-matching filters
//!    are skipped
//!
//! A rule with no patterns forwards everything.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::rules::model::{Destination, Rule};
use crate::types::ChatId;

/// Decide whether `text` passes `rule`. Never fails.
pub fn should_forward(rule: &Rule, text: &str) -> bool {
    if !rule.is_active() {
        return false;
    }

    if let Some(ref exclude) = rule.exclude {
        if exclude.is_match(text) {
            debug!(rule = %rule.id, "Message matched exclude pattern");
            return false;
        }
    }

    if let Some(ref include) = rule.include {
        if !include.is_match(text) {
            return false;
        }
    }

    for sub in &rule.submatches {
        let Some(captures) = sub.regex.captures(text) else {
            continue;
        };
        let Some(group) = captures.get(sub.group) else {
            continue;
        };
        if !sub.allowed.contains(group.as_str()) {
            debug!(
                rule = %rule.id,
                captured = group.as_str(),
                "Submatch value not in allowed set"
            );
            return false;
        }
    }

    true
}

/// A destination selected for delivery, with the rule that selected it.
#[derive(Debug, Clone)]
pub struct Route {
    pub rule: Arc<Rule>,
    pub destination: Destination,
}

/// Destinations that should receive `text`, across all rules of one source.
///
/// A destination reachable through several matching rules is delivered once,
/// using the configuration of the first matching rule.
pub fn select_routes(rules: &[Arc<Rule>], text: &str) -> Vec<Route> {
    let mut seen: HashSet<ChatId> = HashSet::new();
    let mut routes = Vec::new();

    for rule in rules {
        if !should_forward(rule, text) {
            continue;
        }
        for dest in &rule.destinations {
            if seen.insert(dest.chat) {
                routes.push(Route {
                    rule: Arc::clone(rule),
                    destination: dest.clone(),
                });
            }
        }
    }

    routes
}

/// Current configuration of `destination` for a source, regardless of matching.
///
/// Active rules are preferred over inactive ones.
pub fn find_route(rules: &[Arc<Rule>], destination: ChatId) -> Option<Route> {
    let pick = |active: bool| {
        rules
            .iter()
            .filter(|r| r.is_active() == active)
            .find_map(|r| {
                r.destination(destination).map(|d| Route {
                    rule: Arc::clone(r),
                    destination: d.clone(),
                })
            })
    };
    pick(true).or_else(|| pick(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleSpec;

    fn compile(spec: RuleSpec) -> Rule {
        Rule::compile(&spec).unwrap()
    }

    #[test]
    fn include_forwards_matching_text() {
        let rule = compile(RuleSpec::new("a", 1).include("#ARK"));
        assert!(should_forward(&rule, "#ARK update"));
        assert!(!should_forward(&rule, "plain text"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let rule = compile(
            RuleSpec::new("b", 1)
                .include("#УТРЕННИЙ")
                .exclude("#УТРЕННИЙ_ОБЗОР"),
        );
        assert!(!should_forward(&rule, "Сегодня #УТРЕННИЙ_ОБЗОР рынков"));
        assert!(should_forward(&rule, "#УТРЕННИЙ кофе"));
    }

    #[test]
    fn exclude_only_rule() {
        let rule = compile(RuleSpec::new("b", 1).exclude("#УТРЕННИЙ_ОБЗОР"));
        assert!(!should_forward(&rule, "#УТРЕННИЙ_ОБЗОР"));
        assert!(should_forward(&rule, "anything else"));
    }

    #[test]
    fn inactive_rule_never_forwards() {
        let rule = compile(RuleSpec::new("c", 1).inactive());
        for text in ["", "#ARK", "anything", "Привет"] {
            assert!(!should_forward(&rule, text));
        }
    }

    #[test]
    fn empty_active_rule_forwards_everything() {
        let rule = compile(RuleSpec::new("d", 1));
        assert!(should_forward(&rule, ""));
        assert!(should_forward(&rule, "whatever"));
    }

    #[test]
    fn submatch_member_passes_non_member_drops() {
        let rule = compile(RuleSpec::new("e", 1).submatch(r"ticker:(\w+)", 1, &["BTC", "ETH"]));
        assert!(should_forward(&rule, "ticker:BTC up"));
        assert!(!should_forward(&rule, "ticker:DOGE up"));
    }

    #[test]
    fn submatch_without_match_is_skipped() {
        let rule = compile(RuleSpec::new("f", 1).submatch(r"ticker:(\w+)", 1, &["BTC"]));
        assert!(should_forward(&rule, "no ticker here"));
    }

    #[test]
    fn submatch_out_of_range_group_is_skipped() {
        let rule = compile(RuleSpec::new("g", 1).submatch(r"ticker:(\w+)", 5, &["BTC"]));
        assert!(should_forward(&rule, "ticker:DOGE"));
    }

    #[test]
    fn submatch_non_participating_group_is_skipped() {
        let rule = compile(RuleSpec::new("h", 1).submatch(r"a(x)?b", 1, &["x"]));
        assert!(should_forward(&rule, "ab"));
        assert!(should_forward(&rule, "axb"));
    }

    #[test]
    fn submatches_compose_as_and() {
        let rule = compile(
            RuleSpec::new("i", 1)
                .submatch(r"ticker:(\w+)", 1, &["BTC"])
                .submatch(r"side:(\w+)", 1, &["long"]),
        );
        assert!(should_forward(&rule, "ticker:BTC side:long"));
        assert!(!should_forward(&rule, "ticker:BTC side:short"));
        assert!(!should_forward(&rule, "ticker:ETH side:long"));
        // Second filter does not match at all, so only the first applies.
        assert!(should_forward(&rule, "ticker:BTC"));
    }

    #[test]
    fn include_must_pass_before_submatch() {
        let rule = compile(
            RuleSpec::new("j", 1)
                .include("#signal")
                .submatch(r"ticker:(\w+)", 1, &["BTC"]),
        );
        assert!(!should_forward(&rule, "ticker:BTC"));
        assert!(should_forward(&rule, "#signal ticker:BTC"));
    }

    #[test]
    fn select_routes_dedups_by_first_matching_rule() {
        let first = Arc::new(compile(
            RuleSpec::new("first", 1)
                .include("#ARK")
                .to(Destination::new(10).indelible())
                .to(Destination::new(20)),
        ));
        let second = Arc::new(compile(
            RuleSpec::new("second", 1)
                .to(Destination::new(10))
                .to(Destination::new(30)),
        ));
        let rules = vec![first, second];

        let routes = select_routes(&rules, "#ARK news");
        let chats: Vec<ChatId> = routes.iter().map(|r| r.destination.chat).collect();
        assert_eq!(chats, vec![10, 20, 30]);
        assert!(routes[0].destination.indelible);
        assert_eq!(routes[0].rule.id, "first");

        let routes = select_routes(&rules, "plain");
        let chats: Vec<ChatId> = routes.iter().map(|r| r.destination.chat).collect();
        assert_eq!(chats, vec![10, 30]);
        assert!(!routes[0].destination.indelible);
    }

    #[test]
    fn find_route_prefers_active_rules() {
        let inactive = Arc::new(compile(
            RuleSpec::new("old", 1)
                .inactive()
                .to(Destination::new(10).indelible()),
        ));
        let active = Arc::new(compile(RuleSpec::new("new", 1).to(Destination::new(10))));
        let rules = vec![inactive.clone(), active];
        let route = find_route(&rules, 10).unwrap();
        assert_eq!(route.rule.id, "new");

        let only_inactive = vec![inactive];
        assert_eq!(find_route(&only_inactive, 10).unwrap().rule.id, "old");
        assert!(find_route(&only_inactive, 99).is_none());
    }
}
