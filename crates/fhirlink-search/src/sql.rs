//! SQL bind values and positional placeholder bookkeeping.
//!
//! Parameter implementations write their filter fragments with `?`
//! placeholders; the query orchestrator renumbers them to PostgreSQL `$n`
//! placeholders in the order the fragments enter the statement text. Bind
//! values are collected in that same order, so textual position and bind
//! position cannot drift apart.

/// Owned value bound to one positional SQL placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// A value cast to `jsonb` by the fragment (e.g. `?::jsonb`).
    Json(String),
    Timestamp(String),
    Null,
}

impl SqlValue {
    /// String form for display and debug logging.
    pub fn as_display_str(&self) -> String {
        match self {
            Self::Text(s) | Self::Json(s) | Self::Timestamp(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Null => "NULL".to_string(),
        }
    }
}

/// Replace each `?` in `fragment` with `$n`, continuing from `next_index`.
///
/// `next_index` is advanced past the placeholders consumed, so successive
/// fragments number on from each other. `??` is the PostgreSQL JSONB
/// existence operator escape and passes through as a literal `?`.
pub fn number_placeholders(fragment: &str, next_index: &mut usize) -> String {
    let mut numbered = String::with_capacity(fragment.len() + 4);
    let mut chars = fragment.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '?' {
            if chars.peek() == Some(&'?') {
                chars.next();
                numbered.push('?');
            } else {
                numbered.push('$');
                numbered.push_str(&next_index.to_string());
                *next_index += 1;
            }
        } else {
            numbered.push(c);
        }
    }

    numbered
}
