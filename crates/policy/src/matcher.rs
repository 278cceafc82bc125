//! Resource and action pattern matching.
//!
//! Resources are `/`-separated paths compared case-sensitively. A pattern
//! segment of `*` matches exactly one non-empty segment; a pattern that is
//! just `*` matches any resource. Actions compare case-insensitively and a
//! pattern may list alternatives (`GET|PUT`, optionally parenthesised).

/// Token used for a single-level wildcard segment.
pub const WILDCARD: &str = "*";

/// Returns whether `resource` is matched by `pattern`.
pub fn resource_matches(pattern: &str, resource: &str) -> bool {
    if pattern == WILDCARD || pattern == resource {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    let mut pat = pattern.split('/');
    let mut res = resource.split('/');
    loop {
        match (pat.next(), res.next()) {
            (None, None) => return true,
            (Some(p), Some(r)) => {
                if p == WILDCARD {
                    if r.is_empty() {
                        return false;
                    }
                } else if p != r {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Returns whether `action` is matched by `pattern`.
pub fn action_matches(pattern: &str, action: &str) -> bool {
    let action = action.trim();
    action_alternatives(pattern).any(|alt| alt == WILDCARD || alt.eq_ignore_ascii_case(action))
}

/// Splits an action pattern into its alternatives (`(GET|PUT)` -> `GET`, `PUT`).
pub fn action_alternatives(pattern: &str) -> impl Iterator<Item = &str> {
    let trimmed = pattern.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(trimmed);
    inner.split('|').map(str::trim).filter(|s| !s.is_empty())
}

/// Canonical (uppercase) form of a single action.
pub fn normalize_action(action: &str) -> String {
    action.trim().to_ascii_uppercase()
}
