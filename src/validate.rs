// SPDX-License-Identifier: Apache-2.0

//! Path-traversal and ReDoS defenses shared by the locator, the ring buffer,
//! and the readiness wait.

use crate::error::ValidationError;
use regex::Regex;

const MAX_SEGMENT_LEN: usize = 64;
const MAX_NAME_LEN: usize = 128;
const MAX_PATTERN_LEN: usize = 200;

fn is_valid_segment_charset(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() || segment.len() > MAX_SEGMENT_LEN {
        return Err(ValidationError::SegmentLength(segment.to_string()));
    }
    if !is_valid_segment_charset(segment) {
        return Err(ValidationError::SegmentCharset(segment.to_string()));
    }
    Ok(())
}

/// Validates a base name: a single `[A-Za-z0-9_-]{1,64}` segment.
pub fn validate_base_name(name: &str) -> Result<(), ValidationError> {
    validate_segment(name)
}

/// Validates a composed service name (`base` or `prefix:base`, where `prefix`
/// may itself contain `/`-separated segments). Must be checked before any
/// filesystem join is attempted; it is the primary defense against path
/// traversal via service names.
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ValidationError::NameLength(name.to_string()));
    }

    let (prefix, base) = match name.rsplit_once(':') {
        Some((prefix, base)) => (Some(prefix), base),
        None => (None, name),
    };

    validate_segment(base)?;

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err(ValidationError::SegmentLength(prefix.to_string()));
        }
        for segment in prefix.split('/') {
            validate_segment(segment)?;
        }
    }

    Ok(())
}

/// Heuristic signatures of catastrophic/ambiguous quantification. Any match
/// rejects the pattern before it is compiled.
fn looks_dangerous(pattern: &str) -> bool {
    static ADJACENT_WILDCARDS: &[&str] = &[".*.*", ".+.+", ".*.+", ".+.*"];
    if ADJACENT_WILDCARDS.iter().any(|s| pattern.contains(s)) {
        return true;
    }

    // a bracket class flanked by quantifiers on both sides, e.g. `[a-z]*[a-z]*`
    if let Ok(bracket_quantified) = Regex::new(r"\][*+?]\[[^\]]*\][*+?]") {
        if bracket_quantified.is_match(pattern) {
            return true;
        }
    }

    // a quantifier applied to a group containing alternation: (a|b)+
    if let Ok(group_alt_quantified) = Regex::new(r"\([^()]*\|[^()]*\)[*+]") {
        if group_alt_quantified.is_match(pattern) {
            return true;
        }
    }

    // two consecutive {n,m} quantifiers
    if let Ok(double_bound) = Regex::new(r"\{\d+(,\d*)?\}\{\d+(,\d*)?\}") {
        if double_bound.is_match(pattern) {
            return true;
        }
    }

    // more than three open groups combined with any quantifier
    let open_groups = pattern.matches('(').count();
    let has_quantifier = pattern.contains('*') || pattern.contains('+') || pattern.contains('{');
    if open_groups > 3 && has_quantifier {
        return true;
    }

    false
}

/// Validates and compiles a regex pattern, defending against catastrophic
/// backtracking. Shared by the ring buffer's grep filter and the readiness
/// wait's pattern matching.
pub fn compile_safe_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, ValidationError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(ValidationError::PatternTooLong);
    }
    if looks_dangerous(pattern) {
        return Err(ValidationError::PatternDangerous(pattern.to_string()));
    }
    regex::RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| ValidationError::PatternInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_service_name("../etc/passwd").is_err());
        assert!(validate_service_name("a/../b").is_err());
    }

    #[test]
    fn accepts_nested_prefix() {
        assert!(validate_service_name("frontend:api").is_ok());
        assert!(validate_service_name("a/b:c").is_ok());
    }

    #[test]
    fn rejects_oversize_segment() {
        let segment = "a".repeat(65);
        assert!(validate_service_name(&segment).is_err());
    }

    #[test]
    fn rejects_oversize_name() {
        let name = "a".repeat(129);
        assert!(validate_service_name(&name).is_err());
    }

    #[test]
    fn rejects_dangerous_patterns() {
        assert!(compile_safe_regex(".*.*", true).is_err());
        assert!(compile_safe_regex("(a|b)+", true).is_err());
        assert!(compile_safe_regex("a{1,10}{1,10}", true).is_err());
    }

    #[test]
    fn accepts_reasonable_patterns() {
        assert!(compile_safe_regex("^ERROR:", true).is_ok());
        assert!(compile_safe_regex("[0-9]+", true).is_ok());
    }

    #[test]
    fn rejects_overlong_pattern() {
        let pattern = "a".repeat(201);
        assert!(compile_safe_regex(&pattern, true).is_err());
    }
}
