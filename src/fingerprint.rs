use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Fingerprint assigned to queries that normalize to nothing
/// (empty, whitespace-only or comment-only text).
pub const EMPTY_FINGERPRINT: &str = "<empty>";

static RE_USE: OnceLock<Regex> = OnceLock::new();
static RE_STRING_OR_COMMENT: OnceLock<Regex> = OnceLock::new();
static RE_NUMBER: OnceLock<Regex> = OnceLock::new();
static RE_WHITESPACE: OnceLock<Regex> = OnceLock::new();
static RE_COMMA: OnceLock<Regex> = OnceLock::new();
static RE_PAREN_OPEN: OnceLock<Regex> = OnceLock::new();
static RE_PAREN_CLOSE: OnceLock<Regex> = OnceLock::new();
static RE_OPERATOR: OnceLock<Regex> = OnceLock::new();
static RE_SIGNED: OnceLock<Regex> = OnceLock::new();
static RE_IN_LIST: OnceLock<Regex> = OnceLock::new();
static RE_VALUES_LIST: OnceLock<Regex> = OnceLock::new();

// Backtick-quoted identifier, with `` as the escaped backtick.
const BACKTICK_IDENT: &str = r"`(?:[^`]|``)*`";

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("fingerprint pattern must compile"))
}

/// Generates a fingerprint for a SQL query by normalizing it.
///
/// Normalization, in order:
/// - Removing a leading `USE <db>;` statement
/// - Replacing quoted strings with `?` and removing comments, in a single
///   left-to-right scan so that `--` inside a string or `'` inside a
///   comment is not misread
/// - Replacing numeric literals (hex, integer, decimal, exponent) with `?`
/// - Collapsing whitespace and converting to lowercase
/// - Canonicalizing spacing around `(`, `)`, `,` and comparison operators
/// - Folding a unary sign into the placeholder that follows it
/// - Collapsing `IN (?, ...)` and placeholder-only `VALUES (...), ...`
///   lists to `(?+)`
/// - Removing trailing semicolons
///
/// Backtick-quoted identifiers are skipped by the string, comment and
/// number scans. Input that is left empty after normalization maps to
/// [`EMPTY_FINGERPRINT`].
pub fn fingerprint(sql: &str) -> String {
    let re_use = compiled(&RE_USE, r"(?i)^\s*use\s+[^\s;]+\s*;");
    let re_string_or_comment = compiled(
        &RE_STRING_OR_COMMENT,
        &format!(
            r#"(?s){BACKTICK_IDENT}|'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.|"")*"|/\*.*?\*/|--[^\n]*|#[^\n]*"#
        ),
    );
    let re_number = compiled(
        &RE_NUMBER,
        &format!(
            r"(?i){BACKTICK_IDENT}|\b0x[0-9a-f]+\b|\b\d+(?:\.\d*)?(?:e[+-]?\d+)?\b|\B\.\d+(?:e[+-]?\d+)?\b"
        ),
    );
    let re_whitespace = compiled(&RE_WHITESPACE, r"\s+");
    let re_comma = compiled(&RE_COMMA, r"\s*,\s*");
    let re_paren_open = compiled(&RE_PAREN_OPEN, r"\(\s+");
    let re_paren_close = compiled(&RE_PAREN_CLOSE, r"\s+\)");
    let re_operator = compiled(
        &RE_OPERATOR,
        r"\s*(->>|->|<=>|<<|>>|<=|>=|<>|!=|:=|=|<|>)\s*",
    );
    let re_signed = compiled(
        &RE_SIGNED,
        r"((?:^|[(,=<>!*/%+\-]|\b(?:select|where|and|or|not|when|then|else|case|between|like|is|by|limit|offset|having|on|set|values|in))\s*)[-+]\s*\?",
    );
    let re_in_list = compiled(&RE_IN_LIST, r"\bin\s*\(\?(?:, \?)*\)");
    let re_values_list = compiled(
        &RE_VALUES_LIST,
        r"\bvalues\s*\(\?(?:, \?)*\)(?:, \(\?(?:, \?)*\))*",
    );

    let no_use = re_use.replace(sql, "");

    let no_literals = re_string_or_comment.replace_all(&no_use, |caps: &Captures| {
        match caps[0].as_bytes()[0] {
            b'`' => caps[0].to_string(),
            b'\'' | b'"' => "?".to_string(),
            _ => " ".to_string(),
        }
    });

    let no_numbers = re_number.replace_all(&no_literals, |caps: &Captures| {
        if caps[0].starts_with('`') {
            caps[0].to_string()
        } else {
            "?".to_string()
        }
    });

    let collapsed = re_whitespace
        .replace_all(&no_numbers, " ")
        .trim()
        .to_lowercase();

    let spaced = re_comma.replace_all(&collapsed, ", ");
    let spaced = re_paren_open.replace_all(&spaced, "(");
    let spaced = re_paren_close.replace_all(&spaced, ")");
    let spaced = re_operator.replace_all(&spaced, " ${1} ");
    let spaced = re_signed.replace_all(spaced.trim(), "${1}?");

    let lists = re_in_list.replace_all(&spaced, "in (?+)");
    let lists = re_values_list.replace_all(&lists, "values (?+)");

    let normalized = lists.trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if normalized.is_empty() {
        EMPTY_FINGERPRINT.to_string()
    } else {
        normalized.to_string()
    }
}
