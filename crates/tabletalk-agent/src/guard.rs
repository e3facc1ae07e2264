//! Read-only statement guard and row-cap enforcer.
//!
//! We use `sqlparser`'s lexer rather than regexes so that keyword-like text
//! inside string literals, comments, or longer identifiers can never trip the
//! guard. This is a conservative shape check, a last line of defense before
//! execution, not a grammar check: the engine still has the final word on
//! whether the statement parses.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;

use crate::identifiers::find_unknown;
use crate::IdentifierCheck;

/// Verdict of the combined pre-execution checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Safe,
    UnsafeStatement(String),
    UnknownIdentifiers(BTreeSet<String>),
}

/// Write/DDL keywords that must never appear as a whole word.
const DISALLOWED: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "ATTACH", "DETACH",
    "COPY", "EXPORT", "IMPORT", "CALL", "PRAGMA", "VACUUM",
];

fn lex(sql: &str) -> Option<Vec<Token>> {
    let dialect = GenericDialect {};
    Tokenizer::new(&dialect, sql).tokenize().ok()
}

fn significant(tokens: &[Token]) -> impl Iterator<Item = &Token> {
    tokens.iter().filter(|t| !matches!(t, Token::Whitespace(_)))
}

/// Why `sql` is not a single read-only statement, or `None` if it is.
pub fn unsafe_reason(sql: &str) -> Option<String> {
    let Some(tokens) = lex(sql) else {
        return Some("statement could not be lexed".to_string());
    };

    // Multi-statement: a semicolon may only be followed by more semicolons.
    let toks: Vec<&Token> = significant(&tokens).collect();
    let mut seen_semicolon = false;
    for t in &toks {
        match t {
            Token::SemiColon => seen_semicolon = true,
            _ if seen_semicolon => {
                return Some("multiple statements are not allowed".to_string());
            }
            _ => {}
        }
    }

    let mut saw_select = false;
    for t in &toks {
        if let Token::Word(w) = t {
            let upper = w.value.to_uppercase();
            if DISALLOWED.contains(&upper.as_str()) {
                return Some(format!("disallowed keyword `{upper}`"));
            }
            if upper == "SELECT" {
                saw_select = true;
            }
        }
    }

    if !saw_select {
        return Some("statement contains no SELECT".to_string());
    }

    None
}

/// True when `sql` is a single read-only SELECT/WITH statement.
pub fn is_safe_select(sql: &str) -> bool {
    unsafe_reason(sql).is_none()
}

/// Guarantee a row cap: if the statement carries no `LIMIT` of its own,
/// append one. Textual, not a rewrite: trailing whitespace and semicolons are
/// stripped and the clause starts on a fresh line so a trailing line comment
/// cannot swallow it. Idempotent.
pub fn ensure_limit(sql: &str, max_rows: usize) -> String {
    let has_limit = match lex(sql) {
        Some(tokens) => significant(&tokens).any(|t| {
            matches!(t, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case("limit"))
        }),
        // Unlexable text still needs an idempotent answer; fall back to a
        // whole-word scan. The safety validator rejects such input anyway.
        None => contains_word_ci(sql, "limit"),
    };
    if has_limit {
        return sql.to_string();
    }
    let trimmed = sql.trim_end().trim_end_matches(';').trim_end();
    format!("{trimmed}\nLIMIT {max_rows}")
}

fn contains_word_ci(text: &str, word: &str) -> bool {
    let lower = text.to_lowercase();
    let word = word.to_lowercase();
    let bytes = lower.as_bytes();
    let mut start = 0;
    while let Some(pos) = lower[start..].find(&word) {
        let i = start + pos;
        let before_ok = i == 0 || !is_ident_byte(bytes[i - 1]);
        let end = i + word.len();
        let after_ok = end >= bytes.len() || !is_ident_byte(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        start = i + 1;
    }
    false
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Run the safety check and (per `check`) the identifier check, in order.
pub fn validate(sql: &str, known: &BTreeSet<String>, check: IdentifierCheck) -> ValidationOutcome {
    if let Some(reason) = unsafe_reason(sql) {
        return ValidationOutcome::UnsafeStatement(reason);
    }
    if check != IdentifierCheck::Off {
        let unknown = find_unknown(sql, known);
        if !unknown.is_empty() {
            return ValidationOutcome::UnknownIdentifiers(unknown);
        }
    }
    ValidationOutcome::Safe
}
