//! Statement inspection: read/write classification and write rewrites.
//!
//! Classification is keyword based. Quoted identifiers are skipped, but
//! keywords inside string literals or comments are counted, so a read
//! statement mentioning `DELETE` in a literal is treated as a write.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Cypher clauses and procedures that modify the graph.
static GRAPH_WRITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\b(CREATE|MERGE|SET|DELETE|REMOVE|DROP|LOAD\s+CSV)\b|\bCALL\b.*\bapoc\.\S*create")
        .expect("graph write pattern is valid")
});

/// SQL verbs that modify data or schema.
static SQL_WRITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|CREATE|ALTER|DROP|TRUNCATE|GRANT|REVOKE)\b|\bREPLACE\s+INTO\b",
    )
    .expect("sql write pattern is valid")
});

static RETURNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b").expect("returning pattern is valid"));

/// Whether a statement reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementClass {
    Read,
    Write,
}

/// The mode an invocation was submitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Read,
    Write,
}

/// Classifies a statement for the given backend family.
pub fn classify(kind: BackendKind, statement: &str) -> StatementClass {
    let (pattern, quotes): (&Regex, &[char]) = if kind.is_graph() {
        (&*GRAPH_WRITE, &['`'][..])
    } else {
        (&*SQL_WRITE, &['`', '"'][..])
    };
    if pattern.is_match(&mask_identifiers(statement, quotes)) {
        StatementClass::Write
    } else {
        StatementClass::Read
    }
}

/// Blanks out quoted identifiers, keeping byte offsets.
///
/// A doubled quote inside an identifier is an escaped quote.
fn mask_identifiers<'s>(statement: &'s str, quotes: &[char]) -> Cow<'s, str> {
    if !statement.contains(quotes) {
        return Cow::Borrowed(statement);
    }

    let mut out = String::with_capacity(statement.len());
    let mut open: Option<char> = None;
    let mut chars = statement.chars().peekable();
    while let Some(c) = chars.next() {
        match open {
            None => {
                if quotes.contains(&c) {
                    open = Some(c);
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            Some(quote) if c == quote => {
                if chars.peek() == Some(&quote) {
                    chars.next();
                    out.push(' ');
                } else {
                    open = None;
                }
                out.push(' ');
            }
            Some(_) => out.extend(std::iter::repeat(' ').take(c.len_utf8())),
        }
    }
    Cow::Owned(out)
}

/// Appends `RETURNING *` when the statement starts with one of `verbs`.
///
/// A trailing `;` is dropped first. Statements that already return rows are
/// left untouched.
pub fn append_returning<'s>(statement: &'s str, verbs: &[&str]) -> Cow<'s, str> {
    let trimmed = statement.trim_end();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    let first = body.split_whitespace().next().unwrap_or_default();

    if !verbs.iter().any(|verb| first.eq_ignore_ascii_case(verb)) || RETURNING.is_match(body) {
        return Cow::Borrowed(statement);
    }
    Cow::Owned(format!("{} RETURNING *", body))
}
