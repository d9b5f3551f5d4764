//! Rule and destination configuration.
//!
//! `RuleSpec` is the serialized form (rule files, persisted config).
//! `Rule` is the compiled form: every pattern is compiled exactly once in
//! [`Rule::compile`] and the result is immutable afterwards.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ChatId;

// ── Enums ───────────────────────────────────────────────────────────

/// Whether a rule participates in matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
}

/// How a message reaches a destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Network-level forward, keeps the original attribution.
    Forward,
    /// Independent copy with transformed content.
    #[default]
    Copy,
}

// ── Destination ─────────────────────────────────────────────────────

/// Link rewriting policy of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPolicy {
    /// Rewrite links to source posts so they point at the destination copies.
    #[serde(default = "default_true")]
    pub rewrite_self: bool,
    /// Remove every link that does not point at the source's own content.
    #[serde(default)]
    pub strip_external: bool,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            rewrite_self: true,
            strip_external: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A configured destination of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub chat: ChatId,
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Deliver albums once, as a single batch.
    #[serde(default)]
    pub copy_once: bool,
    /// Never propagate source deletions to this destination.
    #[serde(default)]
    pub indelible: bool,
    /// Ordered literal `(old, new)` fragment replacements.
    #[serde(default)]
    pub replacements: Vec<(String, String)>,
    #[serde(default)]
    pub links: LinkPolicy,
    /// Public link prefix of the destination, e.g. `https://t.me/mirror`.
    #[serde(default)]
    pub link_base: Option<String>,
}

impl Destination {
    pub fn new(chat: ChatId) -> Self {
        Self {
            chat,
            mode: DeliveryMode::Copy,
            copy_once: false,
            indelible: false,
            replacements: Vec::new(),
            links: LinkPolicy::default(),
            link_base: None,
        }
    }

    pub fn forward(mut self) -> Self {
        self.mode = DeliveryMode::Forward;
        self
    }

    pub fn copy_once(mut self) -> Self {
        self.copy_once = true;
        self
    }

    pub fn indelible(mut self) -> Self {
        self.indelible = true;
        self
    }

    pub fn with_replacement(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.replacements.push((old.into(), new.into()));
        self
    }

    pub fn with_link_base(mut self, base: impl Into<String>) -> Self {
        self.link_base = Some(base.into());
        self
    }

    pub fn strip_external_links(mut self) -> Self {
        self.links.strip_external = true;
        self
    }

    /// Flags captured in a delivery record at creation time.
    pub fn flags(&self) -> DeliveryFlags {
        DeliveryFlags {
            mode: self.mode,
            copy_once: self.copy_once,
            indelible: self.indelible,
        }
    }
}

/// Destination flags in effect when a copy was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFlags {
    pub mode: DeliveryMode,
    pub copy_once: bool,
    pub indelible: bool,
}

// ── Source profile (attribution) ────────────────────────────────────

/// Attribution data of a source chat.
///
/// The signature and the title link are appended only for destinations
/// listed in `signature_to` / `link_to` respectively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    #[serde(default)]
    pub title: Option<String>,
    /// Public link prefix of the source, e.g. `https://t.me/origin`.
    #[serde(default)]
    pub link_base: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub signature_to: HashSet<ChatId>,
    #[serde(default)]
    pub link_to: HashSet<ChatId>,
}

// ── Rule specs ──────────────────────────────────────────────────────

/// Serialized submatch filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmatchSpec {
    pub pattern: String,
    pub group: usize,
    pub allowed: Vec<String>,
}

/// Serialized forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Stable identifier; generated from the source and position when empty.
    #[serde(default)]
    pub id: String,
    pub source: ChatId,
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub submatches: Vec<SubmatchSpec>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub profile: SourceProfile,
}

impl RuleSpec {
    pub fn new(id: impl Into<String>, source: ChatId) -> Self {
        Self {
            id: id.into(),
            source,
            include: None,
            exclude: None,
            submatches: Vec::new(),
            status: RuleStatus::Active,
            destinations: Vec::new(),
            profile: SourceProfile::default(),
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include = Some(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    pub fn submatch(mut self, pattern: impl Into<String>, group: usize, allowed: &[&str]) -> Self {
        self.submatches.push(SubmatchSpec {
            pattern: pattern.into(),
            group,
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = RuleStatus::Inactive;
        self
    }

    pub fn to(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn with_profile(mut self, profile: SourceProfile) -> Self {
        self.profile = profile;
        self
    }
}

// ── Compiled rules ──────────────────────────────────────────────────

/// A compiled submatch filter.
#[derive(Debug, Clone)]
pub struct SubmatchRule {
    pub regex: Regex,
    pub group: usize,
    pub allowed: HashSet<String>,
}

/// A compiled forwarding rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub source: ChatId,
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
    pub submatches: Vec<SubmatchRule>,
    pub status: RuleStatus,
    pub destinations: Vec<Destination>,
    pub profile: SourceProfile,
}

impl Rule {
    /// Compile every pattern of a spec.
    pub fn compile(spec: &RuleSpec) -> Result<Self, ConfigError> {
        let compile = |field: &str, pattern: &str| {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                rule: spec.id.clone(),
                field: field.to_string(),
                message: e.to_string(),
            })
        };

        let include = spec
            .include
            .as_deref()
            .map(|p| compile("include", p))
            .transpose()?;
        let exclude = spec
            .exclude
            .as_deref()
            .map(|p| compile("exclude", p))
            .transpose()?;

        let mut submatches = Vec::with_capacity(spec.submatches.len());
        for (i, sub) in spec.submatches.iter().enumerate() {
            submatches.push(SubmatchRule {
                regex: compile(&format!("submatch[{i}]"), &sub.pattern)?,
                group: sub.group,
                allowed: sub.allowed.iter().cloned().collect(),
            });
        }

        Ok(Self {
            id: spec.id.clone(),
            source: spec.source,
            include,
            exclude,
            submatches,
            status: spec.status,
            destinations: spec.destinations.clone(),
            profile: spec.profile.clone(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn destination(&self, chat: ChatId) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.chat == chat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_valid_rule() {
        let spec = RuleSpec::new("r1", -100)
            .include("#ARK")
            .exclude("(?i)advert")
            .submatch(r"#(\w+)", 1, &["ARK", "NEWS"])
            .to(Destination::new(-200));
        let rule = Rule::compile(&spec).unwrap();
        assert!(rule.include.is_some());
        assert!(rule.exclude.is_some());
        assert_eq!(rule.submatches.len(), 1);
        assert!(rule.submatches[0].allowed.contains("NEWS"));
        assert!(rule.destination(-200).is_some());
        assert!(rule.destination(-300).is_none());
    }

    #[test]
    fn compile_rejects_bad_pattern() {
        let spec = RuleSpec::new("broken", -100).include("(unclosed");
        match Rule::compile(&spec) {
            Err(ConfigError::InvalidPattern { rule, field, .. }) => {
                assert_eq!(rule, "broken");
                assert_eq!(field, "include");
            }
            other => panic!("Expected InvalidPattern, got {:?}", other),
        }
    }

    #[test]
    fn compile_rejects_bad_submatch() {
        let spec = RuleSpec::new("broken", -100).submatch("[a-", 0, &[]);
        assert!(matches!(
            Rule::compile(&spec),
            Err(ConfigError::InvalidPattern { field, .. }) if field == "submatch[0]"
        ));
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let json = r##"{
            "source": -1001,
            "include": "#ARK",
            "destinations": [
                {"chat": -2002, "copy_once": true, "replacements": [["old.com", "new.com"]]}
            ]
        }"##;
        let spec: RuleSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.status, RuleStatus::Active);
        assert!(spec.id.is_empty());
        let dest = &spec.destinations[0];
        assert_eq!(dest.mode, DeliveryMode::Copy);
        assert!(dest.copy_once);
        assert!(!dest.indelible);
        assert!(dest.links.rewrite_self);
        assert!(!dest.links.strip_external);
        assert_eq!(dest.replacements[0], ("old.com".into(), "new.com".into()));
    }

    #[test]
    fn flags_capture_destination_settings() {
        let dest = Destination::new(1).forward().indelible();
        let flags = dest.flags();
        assert_eq!(flags.mode, DeliveryMode::Forward);
        assert!(flags.indelible);
        assert!(!flags.copy_once);
    }
}
