//! SQL text normalization and fingerprints.
//!
//! Literals collapse to `?`, identifiers and keywords lowercase, whitespace
//! and comments disappear. Two statements that differ only in constants share
//! a digest, which keys the statement summary.

use std::{fmt, hash::BuildHasher};

const DIGEST_SEEDS: (u64, u64, u64, u64) = (
    0x5157_4c44_4947_4553,
    0x0f0e_0d0c_0b0a_0908,
    0x1357_9bdf_2468_ace0,
    0x7f4a_7c15_9e37_79b9,
);

/// 64-bit fingerprint of normalized text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(u64);

impl Digest {
    pub fn of(normalized: &str) -> Self {
        let (a, b, c, d) = DIGEST_SEEDS;
        Digest(ahash::RandomState::with_seeds(a, b, c, d).hash_one(normalized))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Normalize `sql` and fingerprint it.
pub fn sql_digest(sql: &str) -> (String, Digest) {
    let normalized = normalize_sql(sql);
    let digest = Digest::of(&normalized);
    (normalized, digest)
}

/// Fingerprint of a plan rendering; plans are already free of user text.
pub fn plan_digest(explain: &str) -> (String, Digest) {
    let normalized = explain
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let digest = Digest::of(&normalized);
    (normalized, digest)
}

pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '\'' | '"' => {
                let quote = c;
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        chars.next();
                    } else if c == quote {
                        if chars.peek() == Some(&quote) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                push_token(&mut out, "?");
            }
            '`' => {
                let mut ident = String::from("`");
                for c in chars.by_ref() {
                    ident.push(c.to_ascii_lowercase());
                    if c == '`' {
                        break;
                    }
                }
                push_token(&mut out, &ident);
            }
            c if c.is_ascii_digit() => {
                while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '.') {
                    chars.next();
                }
                push_token(&mut out, "?");
            }
            c if c.is_alphanumeric() || matches!(c, '_' | '@' | '$') => {
                let mut word = String::new();
                word.push(c.to_ascii_lowercase());
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || matches!(next, '_' | '@' | '$' | '.') {
                        word.push(next.to_ascii_lowercase());
                        chars.next();
                    } else {
                        break;
                    }
                }
                push_token(&mut out, &word);
            }
            '<' | '>' | '=' | '!' => {
                let mut op = String::from(c);
                while let Some(&next) = chars.peek() {
                    if matches!(next, '<' | '>' | '=') {
                        op.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                push_token(&mut out, &op);
            }
            other => {
                let mut buf = [0u8; 4];
                push_token(&mut out, other.encode_utf8(&mut buf));
            }
        }
    }

    collapse_value_lists(&out)
}

/// Tokens are separated by one space, except around parentheses and before
/// separators.
fn push_token(out: &mut String, token: &str) {
    let glued = out.is_empty() || out.ends_with('(') || token.starts_with([',', ')', ';']);
    if !glued {
        out.push(' ');
    }
    out.push_str(token);
}

/// `in (?, ?, ?)` and `values (?, ?), (?, ?)` collapse to a single `(...)`.
fn collapse_value_lists(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len());
    let mut rest = normalized;
    while let Some(start) = rest.find("(?") {
        let tail = &rest[start..];
        let Some(end) = tail.find(')') else {
            break;
        };
        let inner = &tail[1..end];
        let all_placeholders = inner.split(',').all(|part| part.trim() == "?");
        out.push_str(&rest[..start]);
        if all_placeholders && inner.contains(',') {
            out.push_str("(...)");
        } else {
            out.push_str(&tail[..=end]);
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}
