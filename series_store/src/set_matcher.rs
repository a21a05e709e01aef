//! Finite-set analysis of regexp matchers.

use regex_syntax::hir::{Hir, HirKind, Literal};
use regex_syntax::Parser;

/// The set of literal strings equivalent to `pattern`, if the pattern is a
/// plain alternation of literals (`api|web`, a single literal, or the empty
/// string). Anything more expressive — classes, repetitions, anchors,
/// flags — yields `None` and callers fall back to full regexp matching.
pub(crate) fn literal_set(pattern: &str) -> Option<Vec<String>> {
    let hir = Parser::new().parse(pattern).ok()?;
    let hir = strip_groups(&hir);
    match hir.kind() {
        HirKind::Alternation(branches) => branches
            .iter()
            .map(|branch| literal_string(strip_groups(branch)))
            .collect(),
        _ => literal_string(hir).map(|s| vec![s]),
    }
}

fn strip_groups(hir: &Hir) -> &Hir {
    match hir.kind() {
        HirKind::Group(group) => strip_groups(&group.hir),
        _ => hir,
    }
}

fn literal_string(hir: &Hir) -> Option<String> {
    match hir.kind() {
        HirKind::Empty => Some(String::new()),
        HirKind::Literal(Literal::Unicode(c)) => Some(c.to_string()),
        HirKind::Concat(parts) => {
            let mut out = String::new();
            for part in parts {
                match part.kind() {
                    HirKind::Literal(Literal::Unicode(c)) => out.push(*c),
                    _ => return None,
                }
            }
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> Option<Vec<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn alternations_of_literals_are_sets() {
        assert_eq!(literal_set("api|web"), set(&["api", "web"]));
        assert_eq!(literal_set("api|web|db"), set(&["api", "web", "db"]));
        assert_eq!(literal_set("a|b"), set(&["a", "b"]));
        assert_eq!(literal_set("(api|web)"), set(&["api", "web"]));
    }

    #[test]
    fn single_literals_are_sets() {
        assert_eq!(literal_set("api"), set(&["api"]));
        assert_eq!(literal_set("a"), set(&["a"]));
        assert_eq!(literal_set("(api)"), set(&["api"]));
    }

    #[test]
    fn empty_branches_are_literal() {
        assert_eq!(literal_set(""), set(&[""]));
        assert_eq!(literal_set("a|"), set(&["a", ""]));
    }

    #[test]
    fn expressive_patterns_are_not_sets() {
        for pattern in [
            "api.*",
            "api|web.*",
            "a+",
            "a?",
            "[ab]",
            "a.b",
            "(?i)api",
            "^api$",
            "api|^web",
        ] {
            assert_eq!(literal_set(pattern), None, "{:?} is not a finite set", pattern);
        }
    }

    #[test]
    fn invalid_patterns_are_not_sets() {
        assert_eq!(literal_set("a("), None);
    }
}
