//! Content transformation: mention-token resolution, ordered replacement
//! rules, and link-passthrough detection.

use std::sync::LazyLock;

use {
    courier_common::types::{Mention, MentionKind},
    courier_config::Replacement,
    regex::Regex,
};

// <@123>, <@!123> (user), <#123> (channel), <@&123> (role)
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"<(@[!&]?|#)(\d+)>").unwrap();
    re
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"^https?://\S+$").unwrap();
    re
});

/// Hosts whose bare links the destination renders natively; relaying them
/// without an embed lets that preview happen.
const SOCIAL_HOSTS: &[&str] = &[
    "twitter.com",
    "x.com",
    "fxtwitter.com",
    "vxtwitter.com",
    "instagram.com",
    "tiktok.com",
    "youtube.com",
    "youtu.be",
    "reddit.com",
];

const GIF_HOSTS: &[&str] = &["tenor.com", "giphy.com"];

/// Replace raw mention tokens with their resolved display text so the
/// destination shows names instead of dead ids.
pub fn resolve_mentions(content: &str, mentions: &[Mention]) -> String {
    if mentions.is_empty() && !MENTION_RE.is_match(content) {
        return content.to_string();
    }
    MENTION_RE
        .replace_all(content, |caps: &regex::Captures<'_>| {
            let sigil = &caps[1];
            let id = &caps[2];
            let kind = match sigil {
                "#" => MentionKind::Channel,
                "@&" => MentionKind::Role,
                _ => MentionKind::User,
            };
            match mentions.iter().find(|m| m.kind == kind && m.id == id) {
                Some(m) => match kind {
                    MentionKind::Channel => format!("#{}", m.display),
                    _ => format!("@{}", m.display),
                },
                // Unresolvable token: keep something readable, not `<@123>`.
                None => match kind {
                    MentionKind::Channel => "#unknown-channel".to_string(),
                    MentionKind::Role => "@unknown-role".to_string(),
                    MentionKind::User => "@unknown-user".to_string(),
                },
            }
        })
        .into_owned()
}

/// Apply ordered string-replacement rules. Later rules see the output of
/// earlier ones.
pub fn apply_replacements(text: &str, rules: &[Replacement]) -> String {
    let mut out = text.to_string();
    for rule in rules {
        if rule.pattern.is_empty() {
            continue;
        }
        out = out.replace(&rule.pattern, &rule.replace);
    }
    out
}

/// True when the message body is nothing but one social-media link.
#[must_use]
pub fn is_pure_social_link(content: &str) -> bool {
    is_single_link_to(content, SOCIAL_HOSTS)
}

/// True when the message body is nothing but one GIF link.
#[must_use]
pub fn is_pure_gif_link(content: &str) -> bool {
    let trimmed = content.trim();
    if is_single_link_to(trimmed, GIF_HOSTS) {
        return true;
    }
    URL_RE.is_match(trimmed) && trimmed.to_lowercase().ends_with(".gif")
}

fn is_single_link_to(content: &str, hosts: &[&str]) -> bool {
    let trimmed = content.trim();
    if !URL_RE.is_match(trimmed) {
        return false;
    }
    let Ok(url) = url::Url::parse(trimmed) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.strip_prefix("www.").unwrap_or(host);
    hosts.iter().any(|h| host == *h || host.ends_with(&format!(".{h}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention(kind: MentionKind, id: &str, display: &str) -> Mention {
        Mention {
            kind,
            id: id.into(),
            display: display.into(),
        }
    }

    #[test]
    fn resolves_user_channel_and_role_tokens() {
        let mentions = vec![
            mention(MentionKind::User, "1", "alice"),
            mention(MentionKind::Channel, "2", "general"),
            mention(MentionKind::Role, "3", "mods"),
        ];
        let out = resolve_mentions("hey <@1> see <#2>, ping <@&3> and <@!1>", &mentions);
        assert_eq!(out, "hey @alice see #general, ping @mods and @alice");
    }

    #[test]
    fn unresolvable_mention_degrades_gracefully() {
        let out = resolve_mentions("hi <@42>", &[]);
        assert_eq!(out, "hi @unknown-user");
    }

    #[test]
    fn replacements_apply_in_order() {
        let rules = vec![
            Replacement {
                pattern: "foo".into(),
                replace: "bar".into(),
            },
            Replacement {
                pattern: "bar".into(),
                replace: "baz".into(),
            },
        ];
        assert_eq!(apply_replacements("foo", &rules), "baz");
    }

    #[test]
    fn empty_pattern_is_skipped() {
        let rules = vec![Replacement {
            pattern: String::new(),
            replace: "x".into(),
        }];
        assert_eq!(apply_replacements("abc", &rules), "abc");
    }

    #[test]
    fn pure_social_link_detection() {
        assert!(is_pure_social_link("https://x.com/user/status/1"));
        assert!(is_pure_social_link("  https://www.youtube.com/watch?v=abc  "));
        assert!(!is_pure_social_link("look at https://x.com/user/status/1"));
        assert!(!is_pure_social_link("https://example.com/post"));
    }

    #[test]
    fn pure_gif_link_detection() {
        assert!(is_pure_gif_link("https://tenor.com/view/abc-123"));
        assert!(is_pure_gif_link("https://cdn.example.com/funny.GIF"));
        assert!(!is_pure_gif_link("gif https://tenor.com/view/abc"));
    }
}
