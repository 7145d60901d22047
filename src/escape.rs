//! Quoting for identifiers and literals spliced into SQL text.
//!
//! Prefer bound parameters; these are for the places parameters cannot go
//! (identifiers, `LISTEN` channels, DDL).

/// Quote an identifier, doubling embedded double quotes.
pub fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
///
/// Single quotes and backslashes are doubled. A literal containing a
/// backslash is emitted in escape-string form (` E'...'`) so it reads the
/// same whatever `standard_conforming_strings` is set to.
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    let mut has_backslash = false;
    escaped.push('\'');
    for c in value.chars() {
        match c {
            '\'' => escaped.push_str("''"),
            '\\' => {
                escaped.push_str("\\\\");
                has_backslash = true;
            }
            c => escaped.push(c),
        }
    }
    escaped.push('\'');

    if has_backslash {
        format!(" E{}", escaped)
    } else {
        escaped
    }
}
