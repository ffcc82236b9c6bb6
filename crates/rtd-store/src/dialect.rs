//! SQL dialect capability interface.
//!
//! The two physical backends differ in parameter binding, row limiting and
//! auto-increment key syntax. Query-building code consumes this interface
//! instead of branching on the backend at each call site.

/// Per-backend SQL syntax capabilities.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Placeholder for the `n`-th bound parameter (1-based).
    fn placeholder(&self, n: usize) -> String;

    /// Row-limiting clause appended to a SELECT.
    fn limit_clause(&self, limit: i64, offset: i64) -> String;

    /// `column IN (...)` over `count` parameters starting at `first`.
    /// An empty set short-circuits to a match-nothing predicate instead of
    /// emitting invalid SQL.
    fn in_clause(&self, column: &str, first: usize, count: usize) -> String;

    /// Column definition for a locally auto-incremented primary key.
    fn auto_increment_pk(&self) -> &'static str;

    /// Whether INSERT .. RETURNING is available; otherwise the last insert
    /// rowid is queried separately.
    fn supports_returning(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    fn limit_clause(&self, limit: i64, offset: i64) -> String {
        format!("LIMIT {limit} OFFSET {offset}")
    }

    fn in_clause(&self, column: &str, _first: usize, count: usize) -> String {
        if count == 0 {
            return "1 = 0".to_string();
        }
        let marks = vec!["?"; count].join(", ");
        format!("{column} IN ({marks})")
    }

    fn auto_increment_pk(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn supports_returning(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn limit_clause(&self, limit: i64, offset: i64) -> String {
        format!("LIMIT {limit} OFFSET {offset}")
    }

    fn in_clause(&self, column: &str, first: usize, count: usize) -> String {
        if count == 0 {
            return "1 = 0".to_string();
        }
        let marks = (0..count)
            .map(|i| format!("${}", first + i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{column} IN ({marks})")
    }

    fn auto_increment_pk(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }

    fn supports_returning(&self) -> bool {
        true
    }
}

/// Comma-separated placeholder list for `count` parameters starting at
/// `first`.
pub fn placeholders(dialect: &dyn SqlDialect, first: usize, count: usize) -> String {
    (0..count)
        .map(|i| dialect.placeholder(first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `col = $n, col = $n+1, ...` assignment list starting at parameter `first`.
pub fn set_list(dialect: &dyn SqlDialect, first: usize, columns: &[&str]) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = {}", dialect.placeholder(first + i)))
        .collect::<Vec<_>>()
        .join(", ")
}
