//! Named queries, bound arguments and the log prettifier.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query as SqlxQuery;
use std::fmt;

/// A value bound to a query placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// SQL `NULL` (sent as a text-typed null)
    Null,
    /// `BOOLEAN`
    Bool(bool),
    /// `BIGINT`
    Int(i64),
    /// `DOUBLE PRECISION`
    Float(f64),
    /// `TEXT`
    Text(String),
    /// `BYTEA`
    Bytes(Vec<u8>),
    /// `TIMESTAMPTZ`
    Timestamp(DateTime<Utc>),
}

impl Arg {
    /// Render the value as it should appear inlined in a logged query.
    fn render(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Text(value) => format!("{value:?}"),
            Self::Bytes(value) => format!("{:?}", String::from_utf8_lossy(value)),
            Self::Timestamp(value) => format!("{:?}", value.to_rfc3339()),
        }
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Arg {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T> From<Option<T>> for Arg
where
    T: Into<Self>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A SQL statement with a name for logs and its bound arguments.
///
/// ```
/// use platform_common_postgres::Query;
///
/// let query = Query::new("user.rename", "UPDATE users SET name = $1 WHERE id = $2")
///     .arg("alice")
///     .arg(42_i64);
///
/// assert_eq!(
///     query.pretty(),
///     r#"UPDATE users SET name = "alice" WHERE id = 42"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Label used in logs, e.g. `user_repository.create`
    pub name: String,
    /// Statement text with `$N` placeholders
    pub raw: String,
    /// Arguments in placeholder order
    pub args: Vec<Arg>,
}

impl Query {
    /// Create a query with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: raw.into(),
            args: Vec::new(),
        }
    }

    /// Append the next argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Arg>) -> Self {
        self.args.push(value.into());
        self
    }

    /// The statement with arguments inlined, on one line.
    #[must_use]
    pub fn pretty(&self) -> String {
        pretty(&self.raw, Placeholder::Dollar, &self.args)
    }

    /// Build the sqlx query with every argument bound.
    pub(crate) fn to_sqlx(&self) -> SqlxQuery<'_, sqlx::Postgres, PgArguments> {
        self.args
            .iter()
            .fold(sqlx::query(&self.raw), |query, arg| match arg {
                Arg::Null => query.bind(None::<String>),
                Arg::Bool(value) => query.bind(*value),
                Arg::Int(value) => query.bind(*value),
                Arg::Float(value) => query.bind(*value),
                Arg::Text(value) => query.bind(value.clone()),
                Arg::Bytes(value) => query.bind(value.clone()),
                Arg::Timestamp(value) => query.bind(*value),
            })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Placeholder syntax of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Numbered `$1`, `$2`, ... (`PostgreSQL`)
    Dollar,
    /// Positional `?`
    Question,
}

/// Inline `args` into `query` and collapse it onto one line for logging.
///
/// Text and bytes are double-quoted with escapes; other values are written
/// as-is. Tabs are removed, newlines become spaces and the result is trimmed.
/// Placeholders without a matching argument are left untouched.
#[must_use]
pub fn pretty(query: &str, placeholder: Placeholder, args: &[Arg]) -> String {
    let inlined = match placeholder {
        Placeholder::Dollar => inline_numbered(query, args),
        Placeholder::Question => {
            let mut values = args.iter();
            let mut out = String::with_capacity(query.len());
            for ch in query.chars() {
                match (ch, values.len()) {
                    ('?', remaining) if remaining > 0 => {
                        if let Some(arg) = values.next() {
                            out.push_str(&arg.render());
                        }
                    }
                    _ => out.push(ch),
                }
            }
            out
        }
    };

    inlined.replace('\t', "").replace('\n', " ").trim().to_string()
}

/// Replace each `$N` with `args[N - 1]` in one pass over `query`.
fn inline_numbered(query: &str, args: &[Arg]) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        let mut digits = String::new();
        while let Some(digit) = chars.next_if(char::is_ascii_digit) {
            digits.push(digit);
        }

        match digits.parse::<usize>() {
            Ok(n) if (1..=args.len()).contains(&n) => out.push_str(&args[n - 1].render()),
            _ => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }
    out
}
