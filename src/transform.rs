//! Content transformation for copied messages.
//!
//! Rendering is a pure function of (destination, source profile, text,
//! context). The steps always run in this order:
//! 1. literal fragment replacement (destination's ordered map)
//! 2. link rewriting (source self-links → destination copies, optional
//!    stripping of external links)
//! 3. attribution footer (signature, source link), never rewritten itself
//!
//! A link to the message being rendered cannot point at its copy before the
//! copy exists. Until the copy id is known it is rendered with
//! [`SELF_LINK_PLACEHOLDER`] and `pending_self_links` is set so the caller
//! can patch the copy once the send returns.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::rules::model::{Destination, SourceProfile};
use crate::types::MessageId;

/// Token standing in for the destination copy id before it is known.
pub const SELF_LINK_PLACEHOLDER: &str = "{copy}";

/// Web links and bare `t.me` links.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:https?://[^\s<>"']+|\b(?:t|telegram)\.me/[^\s<>"']+)"#)
        .expect("link pattern is valid")
});

/// Characters that end a sentence rather than a link.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']'];

/// Per-render facts that are not part of the destination configuration.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Id of the rendered message in the source chat.
    pub source_message: MessageId,
    /// Id of this message's copy in the destination, once known.
    pub self_copy: Option<MessageId>,
    /// Known copies of other source messages in this destination.
    pub resolved: HashMap<MessageId, MessageId>,
}

impl RenderContext {
    pub fn new(source_message: MessageId) -> Self {
        Self {
            source_message,
            self_copy: None,
            resolved: HashMap::new(),
        }
    }

    pub fn with_self_copy(mut self, copy: MessageId) -> Self {
        self.self_copy = Some(copy);
        self
    }
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// The text contains [`SELF_LINK_PLACEHOLDER`] and needs a follow-up edit.
    pub pending_self_links: bool,
}

/// Render `text` for `destination`.
pub fn render(
    destination: &Destination,
    profile: &SourceProfile,
    text: &str,
    ctx: &RenderContext,
) -> Rendered {
    let replaced = replace_fragments(text, &destination.replacements);
    let (mut text, pending_self_links) = rewrite_links(&replaced, destination, profile, ctx);
    append_attribution(&mut text, destination, profile, ctx.source_message);
    Rendered {
        text,
        pending_self_links,
    }
}

/// Source post ids linked from `text`, in order of appearance, without duplicates.
///
/// The caller resolves these to destination copies for [`RenderContext::resolved`].
pub fn referenced_posts(profile: &SourceProfile, text: &str) -> Vec<MessageId> {
    let Some(base) = profile.link_base.as_deref() else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    for m in LINK_RE.find_iter(text) {
        let link = m.as_str().trim_end_matches(TRAILING_PUNCTUATION);
        if let Some(id) = strip_base(link, base).as_deref().and_then(post_id) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

// ── Step 1: fragments ───────────────────────────────────────────────

/// Single left-to-right pass; at each position the first pair whose `old`
/// matches wins. Replaced output is never rescanned.
fn replace_fragments(text: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'scan: while !rest.is_empty() {
        for (old, new) in pairs {
            if !old.is_empty() && rest.starts_with(old.as_str()) {
                out.push_str(new);
                rest = &rest[old.len()..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            out.push(ch);
        }
        rest = chars.as_str();
    }
    out
}

// ── Step 2: links ───────────────────────────────────────────────────

/// How a single link is handled.
enum LinkAction {
    Keep,
    Replace(String),
    Strip,
}

fn rewrite_links(
    text: &str,
    destination: &Destination,
    profile: &SourceProfile,
    ctx: &RenderContext,
) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut pending = false;
    let mut last = 0;

    for m in LINK_RE.find_iter(text) {
        let raw = m.as_str();
        let link = raw.trim_end_matches(TRAILING_PUNCTUATION);
        let link_end = m.start() + link.len();

        out.push_str(&text[last..m.start()]);
        match classify_link(link, destination, profile, ctx, &mut pending) {
            LinkAction::Keep => out.push_str(link),
            LinkAction::Replace(new) => out.push_str(&new),
            LinkAction::Strip => {
                // Avoid leaving a double space where the link was.
                if out.ends_with(' ') && text[link_end..].starts_with(' ') {
                    out.pop();
                }
            }
        }
        last = link_end;
    }
    out.push_str(&text[last..]);

    (out, pending)
}

fn classify_link(
    link: &str,
    destination: &Destination,
    profile: &SourceProfile,
    ctx: &RenderContext,
    pending: &mut bool,
) -> LinkAction {
    let Some(source_base) = profile.link_base.as_deref() else {
        return if destination.links.strip_external {
            LinkAction::Strip
        } else {
            LinkAction::Keep
        };
    };

    let Some(rest) = strip_base(link, source_base) else {
        return if destination.links.strip_external {
            LinkAction::Strip
        } else {
            LinkAction::Keep
        };
    };

    // Links into the source itself are never stripped.
    if !destination.links.rewrite_self {
        return LinkAction::Keep;
    }
    let (Some(dest_base), Some(target)) = (destination.link_base.as_deref(), post_id(&rest))
    else {
        return LinkAction::Keep;
    };
    let dest_base = dest_base.trim_end_matches('/');

    if target == ctx.source_message {
        match ctx.self_copy {
            Some(copy) => LinkAction::Replace(format!("{dest_base}/{copy}")),
            None => {
                *pending = true;
                LinkAction::Replace(format!("{dest_base}/{SELF_LINK_PLACEHOLDER}"))
            }
        }
    } else if let Some(copy) = ctx.resolved.get(&target) {
        LinkAction::Replace(format!("{dest_base}/{copy}"))
    } else {
        LinkAction::Keep
    }
}

/// Strip scheme and `www.` and lowercase, for prefix comparison.
fn normalize(link: &str) -> String {
    let lower = link.to_lowercase();
    let no_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    no_scheme
        .strip_prefix("www.")
        .unwrap_or(no_scheme)
        .replacen("telegram.me/", "t.me/", 1)
}

/// The part of `link` after `base/`, if `link` lives under `base`.
fn strip_base(link: &str, base: &str) -> Option<String> {
    let link = normalize(link);
    let base = normalize(base.trim_end_matches('/'));
    link.strip_prefix(&base)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

/// Leading post id of a path like `123`, `123?single` or `123/`.
fn post_id(rest: &str) -> Option<MessageId> {
    let digits: &str = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ── Step 3: attribution ─────────────────────────────────────────────

fn append_attribution(
    text: &mut String,
    destination: &Destination,
    profile: &SourceProfile,
    source_message: MessageId,
) {
    let mut footer: Vec<String> = Vec::new();

    if let Some(ref signature) = profile.signature {
        if profile.signature_to.contains(&destination.chat) {
            footer.push(signature.clone());
        }
    }

    if profile.link_to.contains(&destination.chat) {
        if let Some(base) = profile.link_base.as_deref() {
            let url = format!("{}/{source_message}", base.trim_end_matches('/'));
            let line = match profile.title.as_deref() {
                Some(title) => format!("[{title}]({url})"),
                None => url,
            };
            footer.push(line);
        }
    }

    if footer.is_empty() {
        return;
    }
    if !text.trim().is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(&footer.join("\n"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SourceProfile {
        SourceProfile {
            title: Some("Origin".into()),
            link_base: Some("https://t.me/origin".into()),
            ..Default::default()
        }
    }

    #[test]
    fn fragment_replacement_before_links() {
        let dest = Destination::new(10)
            .with_replacement("old.com", "new.com")
            .with_link_base("https://t.me/mirror");
        let out = render(&dest, &profile(), "see old.com/x", &RenderContext::new(1));
        assert_eq!(out.text, "see new.com/x");
        assert!(!out.pending_self_links);
    }

    #[test]
    fn referenced_posts_lists_source_links_once() {
        let text = "see https://t.me/origin/5, t.me/origin/7 and https://t.me/origin/5 or https://x.com/5";
        assert_eq!(referenced_posts(&profile(), text), vec![5, 7]);
        assert!(referenced_posts(&SourceProfile::default(), text).is_empty());
    }

    #[test]
    fn fragment_first_match_wins_and_no_rescan() {
        let pairs = vec![
            ("ab".to_string(), "X".to_string()),
            ("a".to_string(), "ab".to_string()),
        ];
        assert_eq!(replace_fragments("aab", &pairs), "abX");
        assert_eq!(replace_fragments("Привет мир", &[("мир".into(), "world".into())]), "Привет world");
    }

    #[test]
    fn self_link_gets_placeholder_then_copy_id() {
        let dest = Destination::new(10).with_link_base("https://t.me/mirror");
        let text = "read https://t.me/origin/42 now";

        let pending = render(&dest, &profile(), text, &RenderContext::new(42));
        assert!(pending.pending_self_links);
        assert_eq!(pending.text, "read https://t.me/mirror/{copy} now");

        let patched = render(
            &dest,
            &profile(),
            text,
            &RenderContext::new(42).with_self_copy(7),
        );
        assert!(!patched.pending_self_links);
        assert_eq!(patched.text, "read https://t.me/mirror/7 now");
    }

    #[test]
    fn links_to_other_known_posts_resolve() {
        let dest = Destination::new(10).with_link_base("t.me/mirror/");
        let mut ctx = RenderContext::new(50);
        ctx.resolved.insert(40, 4);
        let out = render(
            &dest,
            &profile(),
            "prev: t.me/origin/40, older: http://telegram.me/Origin/39.",
            &ctx,
        );
        assert_eq!(out.text, "prev: t.me/mirror/4, older: http://telegram.me/Origin/39.");
        assert!(!out.pending_self_links);
    }

    #[test]
    fn self_links_kept_without_destination_base_or_when_disabled() {
        let text = "https://t.me/origin/42";
        let no_base = Destination::new(10);
        assert_eq!(render(&no_base, &profile(), text, &RenderContext::new(42)).text, text);

        let mut disabled = Destination::new(10).with_link_base("https://t.me/mirror");
        disabled.links.rewrite_self = false;
        let out = render(&disabled, &profile(), text, &RenderContext::new(42));
        assert_eq!(out.text, text);
        assert!(!out.pending_self_links);
    }

    #[test]
    fn external_links_stripped_when_requested() {
        let dest = Destination::new(10)
            .with_link_base("https://t.me/mirror")
            .strip_external_links();
        let out = render(
            &dest,
            &profile(),
            "buy at https://shop.example.com/item?id=1 today (https://ads.example.com). see https://t.me/origin/3",
            &RenderContext::new(9),
        );
        assert_eq!(out.text, "buy at today (). see https://t.me/origin/3");
    }

    #[test]
    fn external_links_kept_by_default() {
        let dest = Destination::new(10);
        let text = "docs: https://example.com/a.";
        assert_eq!(render(&dest, &profile(), text, &RenderContext::new(1)).text, text);
    }

    #[test]
    fn attribution_gated_by_membership() {
        let mut profile = profile();
        profile.signature = Some("Origin team".into());
        profile.signature_to.insert(10);
        profile.link_to.insert(10);
        profile.link_to.insert(20);

        let ten = render(&Destination::new(10), &profile, "hello", &RenderContext::new(5));
        assert_eq!(ten.text, "hello\n\nOrigin team\n[Origin](https://t.me/origin/5)");

        let twenty = render(&Destination::new(20), &profile, "hello", &RenderContext::new(5));
        assert_eq!(twenty.text, "hello\n\n[Origin](https://t.me/origin/5)");

        let thirty = render(&Destination::new(30), &profile, "hello", &RenderContext::new(5));
        assert_eq!(thirty.text, "hello");
    }

    #[test]
    fn attribution_not_subject_to_rewriting() {
        let mut profile = profile();
        profile.signature = Some("old.com".into());
        profile.signature_to.insert(10);
        let dest = Destination::new(10).with_replacement("old.com", "new.com");
        let out = render(&dest, &profile, "old.com", &RenderContext::new(1));
        assert_eq!(out.text, "new.com\n\nold.com");
    }

    #[test]
    fn attribution_on_empty_caption() {
        let mut profile = profile();
        profile.link_to.insert(10);
        let out = render(&Destination::new(10), &profile, "", &RenderContext::new(8));
        assert_eq!(out.text, "[Origin](https://t.me/origin/8)");
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut profile = profile();
        profile.signature = Some("sig".into());
        profile.signature_to.insert(10);
        let dest = Destination::new(10)
            .with_replacement("a", "b")
            .with_link_base("https://t.me/mirror")
            .strip_external_links();
        let mut ctx = RenderContext::new(3);
        ctx.resolved.insert(1, 100);
        ctx.resolved.insert(2, 200);
        let text = "a https://t.me/origin/1 https://t.me/origin/2 https://t.me/origin/3 https://x.y";

        let first = render(&dest, &profile, text, &ctx);
        let second = render(&dest, &profile, text, &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn post_id_parsing() {
        assert_eq!(post_id("123"), Some(123));
        assert_eq!(post_id("123?single"), Some(123));
        assert_eq!(post_id("123/"), Some(123));
        assert_eq!(post_id("abc"), None);
        assert_eq!(post_id(""), None);
    }
}
