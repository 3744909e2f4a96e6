//! Condition-clause parsing and evaluation.
//!
//! A predicate has the strict shape `{{path}} <op> '<literal>'` with single
//! or double quotes around the literal. Malformed predicates evaluate to
//! false at run time; workflow validation additionally rejects them at save
//! time.

use crate::template::{resolve_path, stringify};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::OnceLock;

/// Comparison operators supported in condition predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    /// Stringified value contains the literal.
    Contains,
    /// Stringified value equals the literal exactly.
    Equals,
    /// Negated `contains`.
    NotContains,
    /// Negated `equals`.
    NotEquals,
}

impl ConditionOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(Self::Contains),
            "equals" => Some(Self::Equals),
            "not contains" => Some(Self::NotContains),
            "not equals" => Some(Self::NotEquals),
            _ => None,
        }
    }
}

impl fmt::Display for ConditionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Contains => "contains",
            Self::Equals => "equals",
            Self::NotContains => "not contains",
            Self::NotEquals => "not equals",
        };
        f.write_str(s)
    }
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPredicate {
    /// Dotted path into the trigger payload.
    pub path: String,
    /// Comparison operator.
    pub op: ConditionOp,
    /// Literal to compare against.
    pub literal: String,
}

fn predicate_regex() -> &'static Regex {
    static PREDICATE: OnceLock<Regex> = OnceLock::new();
    PREDICATE.get_or_init(|| {
        Regex::new(
            r#"^\s*\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}\s+(contains|equals|not contains|not equals)\s+(?:'([^']*)'|"([^"]*)")\s*$"#,
        )
        .expect("valid regex")
    })
}

/// Parses a predicate template, or `None` when it does not match the strict
/// shape.
#[must_use]
pub fn parse_predicate(predicate: &str) -> Option<ParsedPredicate> {
    let caps = predicate_regex().captures(predicate)?;
    let literal = caps
        .get(3)
        .or_else(|| caps.get(4))
        .map(|m| m.as_str().to_string())?;
    Some(ParsedPredicate {
        path: caps[1].to_string(),
        op: ConditionOp::parse(&caps[2])?,
        literal,
    })
}

impl ParsedPredicate {
    /// Evaluates the predicate against a trigger payload.
    ///
    /// Comparisons are case-insensitive string comparisons after
    /// stringification; a missing path stringifies to the empty string.
    #[must_use]
    pub fn evaluate(&self, data: &JsonValue) -> bool {
        let value = resolve_path(data, &self.path)
            .map(stringify)
            .unwrap_or_default()
            .to_lowercase();
        let literal = self.literal.to_lowercase();

        match self.op {
            ConditionOp::Contains => value.contains(&literal),
            ConditionOp::Equals => value == literal,
            ConditionOp::NotContains => !value.contains(&literal),
            ConditionOp::NotEquals => value != literal,
        }
    }
}

/// Parses and evaluates in one step; malformed predicates are false.
#[must_use]
pub fn evaluate_predicate(predicate: &str, data: &JsonValue) -> bool {
    match parse_predicate(predicate) {
        Some(parsed) => parsed.evaluate(data),
        None => {
            tracing::debug!(predicate, "malformed condition predicate evaluates to false");
            false
        }
    }
}
