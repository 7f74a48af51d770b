//! Token substitution for alert subject/body templates
//!
//! Templates use literal `%NAME%` markers. Fixed tokens (`%APP%`, `%MN%`,
//! `%USER%`) are computed once at startup from the process environment;
//! `%MSG%` and `%EX%` are filled in per alert event.
//!
//! Rendering is a single left-to-right pass: a replaced value is never
//! re-scanned for further tokens, so substitution cannot expand recursively.

use crate::AppIdentity;

/// Fixed token names.
pub const TOKEN_APP: &str = "%APP%";
pub const TOKEN_MACHINE: &str = "%MN%";
pub const TOKEN_USER: &str = "%USER%";
/// Per-event token names.
pub const TOKEN_MESSAGE: &str = "%MSG%";
pub const TOKEN_ERROR: &str = "%EX%";

/// An ordered set of token -> replacement pairs.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    tokens: Vec<(String, String)>,
}

impl TokenSet {
    /// Empty token set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token set with the fixed process-level tokens filled in.
    pub fn fixed(app: &AppIdentity) -> Self {
        let mut set = Self::new();
        set.insert(TOKEN_APP, &app.name);
        set.insert(TOKEN_MACHINE, machine_name());
        set.insert(TOKEN_USER, user_name());
        set
    }

    /// Add or replace a token.
    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        let token = token.into();
        let value = value.into();
        if let Some(entry) = self.tokens.iter_mut().find(|(t, _)| *t == token) {
            entry.1 = value;
        } else {
            self.tokens.push((token, value));
        }
    }

    /// Clone of this set with the per-event `%MSG%`/`%EX%` tokens added.
    pub fn with_event(&self, message: &str, error: Option<&str>) -> Self {
        let mut set = self.clone();
        set.insert(TOKEN_MESSAGE, message);
        set.insert(TOKEN_ERROR, error.unwrap_or(""));
        set
    }

    /// Render a template by literal substitution.
    ///
    /// Scans the template once; at each position the first matching token
    /// (in insertion order) is replaced and scanning resumes after the
    /// marker. Replacement values are emitted verbatim, never re-scanned.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        'scan: while !rest.is_empty() {
            for (token, value) in &self.tokens {
                if rest.starts_with(token.as_str()) {
                    out.push_str(value);
                    rest = &rest[token.len()..];
                    continue 'scan;
                }
            }
            match rest.chars().next() {
                Some(ch) => {
                    out.push(ch);
                    rest = &rest[ch.len_utf8()..];
                }
                None => break,
            }
        }

        out
    }
}

/// Machine name from the environment, or "unknown".
pub(crate) fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Current user name from the environment, or "unknown".
fn user_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}
