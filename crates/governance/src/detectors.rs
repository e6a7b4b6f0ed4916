//! Content detectors used by the policy engine.
//!
//! - PII patterns (email, national ID, phone)
//! - Destructive statements (mutating verb with an unscoped predicate)

use regex::Regex;
use switchboard_core::{Error, Result};

/// Longest evidence snippet kept for shadow logging.
pub const MAX_EVIDENCE_CHARS: usize = 80;

/// Truncate matched text to a bounded snippet on a char boundary.
pub fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_EVIDENCE_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::config(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Built-in PII pattern families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiPattern {
    Email,
    /// `NNN-NN-NNNN`
    NationalId,
    /// `NNN-NNNN` (dash only), `NNN-NNN-NNNN`, `(NNN) NNN-NNNN`, optional `+1`
    Phone,
}

impl PiiPattern {
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::Email => r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
            Self::NationalId => r"\b\d{3}-\d{2}-\d{4}\b",
            Self::Phone => {
                r"(?:\+?1[-. ]?)?(?:\(\d{3}\)\s?|\b\d{3}[-. ])\d{3}[-. ]\d{4}\b|\b\d{3}-\d{4}\b"
            }
        }
    }

    pub fn regex(&self) -> Result<Regex> {
        compile(self.pattern())
    }
}

/// Detects SQL/shell statements that mutate without a narrowing clause.
///
/// Matches `DROP TABLE|DATABASE|...`, `TRUNCATE`, `rm -rf /` outright, and
/// `DELETE FROM t` / `UPDATE t SET ...` when the `WHERE` clause is absent or
/// trivially true (`1=1`, `'a'='a'`, `x = x`, `TRUE`, or an `OR` branch that is).
#[derive(Debug, Clone)]
pub struct DestructiveMatcher {
    drop_re: Regex,
    truncate_re: Regex,
    shell_re: Regex,
    delete_re: Regex,
    update_re: Regex,
    /// After `DELETE FROM t`: optional alias, then `WHERE`.
    delete_scope_re: Regex,
    /// After `UPDATE t SET`: the assignment list, then `WHERE`.
    update_scope_re: Regex,
    /// Start of the next statement or paragraph; ends a predicate.
    boundary_re: Regex,
    tail_re: Regex,
    or_re: Regex,
    and_re: Regex,
    eq_re: Regex,
    operator_re: Regex,
}

impl DestructiveMatcher {
    pub fn new() -> Result<Self> {
        let value = r#"(?:'[^']*'|"[^"]*"|[\w.+\-*/()]+)"#;
        let expr = format!(r"{value}(?:\s*(?:[-+*/]|\|\|)\s*{value})*");
        let assignment = format!(r#"[\w."`\[\]]+\s*=\s*{expr}"#);

        Ok(Self {
            drop_re: compile(r"(?i)\bDROP\s+(?:TABLE|DATABASE|SCHEMA|VIEW|INDEX|COLLECTION)\b[^;]*")?,
            truncate_re: compile(
                r#"(?i)\bTRUNCATE\s+TABLE\s+[\w."`\[\]]+|\bTRUNCATE\s+[\w."`\[\]]+\s*$"#,
            )?,
            shell_re: compile(r"(?i)\brm\s+-(?:rf|fr)\s+(?:--no-preserve-root\s+)?(?:/\*?|~/?|\*)(?:\s|$)")?,
            delete_re: compile(r#"(?i)\bDELETE\s+FROM\s+[\w."`\[\]]+"#)?,
            update_re: compile(r#"(?i)\bUPDATE\s+[\w."`\[\]]+\s+SET\b"#)?,
            delete_scope_re: compile(r"(?i)^\s+(?:(?:AS\s+)?[A-Za-z_]\w*\s+)?WHERE\b")?,
            update_scope_re: compile(&format!(
                r"(?i)^\s+{assignment}(?:\s*,\s*{assignment})*\s+WHERE\b"
            ))?,
            boundary_re: compile(r"(?i)\b(?:DELETE|UPDATE|SELECT|INSERT|DROP|TRUNCATE)\b|\n\s*\n")?,
            tail_re: compile(r"(?i)\b(?:ORDER\s+BY|GROUP\s+BY|LIMIT|RETURNING)\b")?,
            or_re: compile(r"(?i)\s+OR\s+")?,
            and_re: compile(r"(?i)\s+AND\s+")?,
            eq_re: compile(r#"^\(*\s*([\w'".]+)\s*==?\s*([\w'".]+)\s*\)*(?:\s|$)"#)?,
            operator_re: compile(r"(?i)[=<>]|\bLIKE\b|\bIN\b|\bIS\b|\bBETWEEN\b")?,
        })
    }

    /// Return the offending statement text, if any.
    pub fn find(&self, text: &str) -> Option<String> {
        if let Some(m) = self.shell_re.find(text) {
            return Some(snippet(m.as_str()));
        }
        text.split(';').find_map(|stmt| self.find_in_statement(stmt))
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    fn find_in_statement(&self, stmt: &str) -> Option<String> {
        if let Some(m) = self.drop_re.find(stmt) {
            return Some(snippet(m.as_str()));
        }
        if let Some(m) = self.truncate_re.find(stmt) {
            return Some(snippet(m.as_str()));
        }
        // Every occurrence counts: a scoped DELETE must not hide a later unscoped one.
        let verbs = [
            (&self.delete_re, &self.delete_scope_re),
            (&self.update_re, &self.update_scope_re),
        ];
        for (verb, scope) in verbs {
            for m in verb.find_iter(stmt) {
                let rest = &stmt[m.end()..];
                if self.is_unscoped(rest, scope) {
                    let end = m.end() + self.boundary(rest);
                    return Some(snippet(&stmt[m.start()..end]));
                }
            }
        }
        None
    }

    /// Offset in `rest` where the current statement ends.
    fn boundary(&self, rest: &str) -> usize {
        self.boundary_re.find(rest).map(|b| b.start()).unwrap_or(rest.len())
    }

    /// `rest` is everything after the verb and target. The `WHERE` must follow
    /// the target directly; a later "where" belongs to prose or another statement.
    fn is_unscoped(&self, rest: &str, scope: &Regex) -> bool {
        let Some(w) = scope.find(rest) else {
            return true;
        };
        let after = &rest[w.end()..];
        let mut predicate = &after[..self.boundary(after)];
        if let Some(tail) = self.tail_re.find(predicate) {
            predicate = &predicate[..tail.start()];
        }
        let predicate = predicate.trim();
        if predicate.is_empty() {
            return true;
        }
        self.or_re
            .split(predicate)
            .any(|disjunct| self.is_tautological_conjunction(disjunct))
    }

    /// All predicate-looking conjuncts are tautologies. Trailing prose ends the clause.
    fn is_tautological_conjunction(&self, disjunct: &str) -> bool {
        let mut considered = 0;
        for conjunct in self.and_re.split(disjunct) {
            let conjunct = conjunct.trim();
            if considered > 0 && !self.looks_like_predicate(conjunct) {
                break;
            }
            if !self.is_tautology(conjunct) {
                return false;
            }
            considered += 1;
        }
        considered > 0
    }

    fn looks_like_predicate(&self, conjunct: &str) -> bool {
        self.operator_re.is_match(conjunct) || is_literal_true(conjunct)
    }

    fn is_tautology(&self, conjunct: &str) -> bool {
        if !conjunct.contains(['=', '<', '>']) && is_literal_true(conjunct) {
            return true;
        }
        self.eq_re
            .captures(conjunct)
            .map(|caps| caps[1].eq_ignore_ascii_case(&caps[2]))
            .unwrap_or(false)
    }
}

fn is_literal_true(conjunct: &str) -> bool {
    let first = conjunct
        .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace())
        .split_whitespace()
        .next()
        .unwrap_or("");
    first.eq_ignore_ascii_case("true") || first == "1"
}
