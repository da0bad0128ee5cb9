//! Token extraction shared by drafting and rendering.
//!
//! Hashtags (`#tag`), cashtags (`$tag`) and mentions (`@user`) are
//! recognised by one regex: a sigil at the start of the text or after
//! whitespace, followed by letters, marks, digits, `-` or `_`. Tokens that
//! are purely numeric (`#123`) are not tags. Blob references are
//! `/blob/<id>` paths with an 8-hex-char id that start a token or a link
//! target; a `/blob/` segment inside a longer URL is not a reference.
//!
//! Cost estimation in [`crate::draft`] and link rewriting in
//! [`crate::render`] both go through this module so the counts a user is
//! warned about match what ends up linked on screen.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};

const FENCE: &str = "```";

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|\s)([#$@])([\p{L}\p{M}\d_\-]+)").expect("token regex is valid")
    })
}

fn blob_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s(<\[])/blob/([0-9A-Fa-f]{8})\b").expect("blob regex is valid")
    })
}

/// Kind of a sigil-prefixed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenKind {
    Hashtag,
    Cashtag,
    Mention,
}

impl TokenKind {
    fn from_sigil(sigil: &str) -> Option<Self> {
        match sigil {
            "#" => Some(TokenKind::Hashtag),
            "$" => Some(TokenKind::Cashtag),
            "@" => Some(TokenKind::Mention),
            _ => None,
        }
    }

    pub fn sigil(self) -> char {
        match self {
            TokenKind::Hashtag => '#',
            TokenKind::Cashtag => '$',
            TokenKind::Mention => '@',
        }
    }
}

fn is_numeric(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit())
}

/// Visit every non-fenced line of `text`, keeping fenced code untouched.
fn map_unfenced_lines(text: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with(FENCE) {
            in_fence = !in_fence;
            out.push_str(line);
        } else if in_fence {
            out.push_str(line);
        } else {
            out.push_str(&f(line));
        }
    }
    out
}

/// All tokens of the given kind, deduplicated, without their sigil.
pub fn extract(text: &str, kind: TokenKind) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    map_unfenced_lines(text, |line| {
        for caps in token_regex().captures_iter(line) {
            let token = &caps[3];
            if TokenKind::from_sigil(&caps[2]) == Some(kind) && !is_numeric(token) {
                found.insert(token.to_string());
            }
        }
        String::new()
    });
    found
}

pub fn hashtags(text: &str) -> BTreeSet<String> {
    extract(text, TokenKind::Hashtag)
}

pub fn cashtags(text: &str) -> BTreeSet<String> {
    extract(text, TokenKind::Cashtag)
}

pub fn mentions(text: &str) -> BTreeSet<String> {
    extract(text, TokenKind::Mention)
}

/// Number of distinct tags (hashtags and cashtags) used for cost estimation.
pub fn tag_count(text: &str) -> usize {
    hashtags(text).len() + cashtags(text).len()
}

/// Distinct `/blob/<id>` references in order of first appearance.
pub fn blob_references(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    blob_regex()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// The id in a link target that is exactly `/blob/<id>`.
pub fn blob_target(url: &str) -> Option<&str> {
    let caps = blob_regex().captures(url)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == url.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Rewrite tokens into markdown links, leaving fenced code alone.
///
/// `link` receives the token kind and name and returns the link target.
pub fn rewrite_links(text: &str, link: impl Fn(TokenKind, &str) -> String) -> String {
    map_unfenced_lines(text, |line| {
        token_regex()
            .replace_all(line, |caps: &Captures| {
                let lead = &caps[1];
                let sigil = &caps[2];
                let token = &caps[3];
                match TokenKind::from_sigil(sigil) {
                    Some(kind) if !is_numeric(token) => {
                        format!("{}[{}{}]({})", lead, sigil, token, link(kind, token))
                    }
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    })
}
