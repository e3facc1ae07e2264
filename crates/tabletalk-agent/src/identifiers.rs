//! Hallucinated-identifier detection.
//!
//! The model may legitimately invent CTE and alias names; only references to
//! nonexistent *source* columns/tables are errors. So the allow-list is the
//! union of:
//!
//! - the known schema identifiers (columns + table/view names, case-insensitive),
//! - a fixed set of SQL keywords, functions, and time-unit words that lex as
//!   plain words,
//! - every alias the query itself introduces: CTE names (`WITH name AS`),
//!   explicit `AS name` aliases, and implicit `FROM t alias` / `JOIN t alias`
//!   table aliases.
//!
//! Extraction runs on `sqlparser`'s token stream, so string literals and
//! numbers are never mistaken for identifiers.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::BTreeSet;

/// Keywords, functions and time-unit words that tokenize as plain words and
/// must never be flagged.
const SQL_WORDS: &[&str] = &[
    // core
    "select", "from", "where", "group", "by", "order", "limit", "having", "with", "as", "and",
    "or", "not", "null", "is", "in", "on", "join", "left", "right", "inner", "outer", "full",
    "cross", "natural", "using", "case", "when", "then", "else", "end", "distinct", "desc",
    "asc", "union", "all", "between", "like", "ilike", "exists", "offset", "true", "false",
    "recursive",
    // aggregates / functions commonly generated
    "count", "sum", "avg", "min", "max", "nullif", "coalesce", "try_cast", "cast",
    "try_strptime", "strptime", "substr", "substring", "date", "date_trunc", "round", "abs",
    "lower", "upper", "concat", "length",
    // interval/time units that lex as words
    "interval", "day", "days", "week", "weeks", "month", "months", "year", "years", "hour",
    "hours", "minute", "minutes", "second", "seconds",
];

fn lex(sql: &str) -> Option<Vec<Token>> {
    let dialect = GenericDialect {};
    Tokenizer::new(&dialect, sql).tokenize().ok()
}

fn word_at<'a>(toks: &'a [&'a Token], i: usize) -> Option<&'a Word> {
    match toks.get(i) {
        Some(Token::Word(w)) => Some(w),
        _ => None,
    }
}

fn is_kw(toks: &[&Token], i: usize, word: &str) -> bool {
    word_at(toks, i)
        .map(|w| w.quote_style.is_none() && w.value.eq_ignore_ascii_case(word))
        .unwrap_or(false)
}

/// Words that terminate an implicit-alias position after `FROM t` / `JOIN t`.
fn is_alias_stop(w: &Word) -> bool {
    let lower = w.value.to_lowercase();
    matches!(
        lower.as_str(),
        "where"
            | "group"
            | "order"
            | "limit"
            | "having"
            | "on"
            | "join"
            | "inner"
            | "left"
            | "right"
            | "full"
            | "cross"
            | "outer"
            | "natural"
            | "union"
            | "as"
            | "using"
            | "when"
            | "then"
            | "and"
            | "or"
            | "select"
    )
}

/// Collect identifiers the query itself introduces and is allowed to use.
fn collect_aliases(toks: &[&Token]) -> BTreeSet<String> {
    let mut aliases = BTreeSet::new();

    for i in 0..toks.len() {
        // WITH name AS / WITH RECURSIVE name AS
        if is_kw(toks, i, "with") {
            let name_idx = if is_kw(toks, i + 1, "recursive") { i + 2 } else { i + 1 };
            if let Some(name) = word_at(toks, name_idx) {
                if is_kw(toks, name_idx + 1, "as") {
                    aliases.insert(name.value.to_lowercase());
                }
            }
        }

        // Chained CTEs: `, name AS (`
        if let Some(name) = word_at(toks, i) {
            if is_kw(toks, i + 1, "as") && matches!(toks.get(i + 2), Some(Token::LParen)) {
                aliases.insert(name.value.to_lowercase());
            }
        }

        // Explicit alias: AS name
        if is_kw(toks, i, "as") {
            if let Some(name) = word_at(toks, i + 1) {
                aliases.insert(name.value.to_lowercase());
            }
        }

        // Implicit table alias: FROM t [.]part alias / JOIN t alias
        if is_kw(toks, i, "from") || is_kw(toks, i, "join") {
            if word_at(toks, i + 1).is_none() {
                continue;
            }
            // Skip the (possibly dotted) table reference.
            let mut j = i + 1;
            while matches!(toks.get(j + 1), Some(Token::Period)) && word_at(toks, j + 2).is_some() {
                j += 2;
            }
            if let Some(alias) = word_at(toks, j + 1) {
                if !is_alias_stop(alias) {
                    aliases.insert(alias.value.to_lowercase());
                }
            }
        }
    }

    aliases
}

/// Identifier-shaped tokens in `sql` that are neither known schema names,
/// SQL words, nor aliases introduced by the query itself. Lowercased, sorted.
///
/// Unlexable input yields an empty set: the safety validator has already
/// rejected anything the lexer cannot handle.
pub fn find_unknown(sql: &str, known: &BTreeSet<String>) -> BTreeSet<String> {
    let Some(tokens) = lex(sql) else {
        return BTreeSet::new();
    };
    let toks: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut allowed: BTreeSet<String> = SQL_WORDS.iter().map(|s| s.to_string()).collect();
    allowed.extend(known.iter().map(|k| k.to_lowercase()));
    allowed.extend(collect_aliases(&toks));

    let mut unknown = BTreeSet::new();
    for t in &toks {
        if let Token::Word(w) = t {
            let lower = w.value.to_lowercase();
            if !allowed.contains(&lower) {
                unknown.insert(lower);
            }
        }
    }
    unknown
}
