//! Query results.

use std::sync::Arc;

use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::protocol::FieldDescription;
use crate::types::PgValue;

/// Shared column descriptions - wrapped in Arc so every row of a result set
/// points at the same RowDescription.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

static NO_COLUMNS: Lazy<SharedColumns> = Lazy::new(|| Arc::new(Vec::new()));

pub(crate) fn no_columns() -> SharedColumns {
    Arc::clone(&NO_COLUMNS)
}

// ============================================================================
// Command Tag
// ============================================================================

/// Parsed CommandComplete tag, e.g. `INSERT 0 5` or `SELECT 3`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTag {
    pub command: Option<String>,
    pub rows: Option<u64>,
    pub oid: Option<u32>,
}

impl CommandTag {
    /// Parse a tag of the form `<COMMAND> [<oid>] [<rows>]`.
    ///
    /// Two numbers are read as oid then rows, a single number as rows. A tag
    /// that does not start with a word yields no command at all.
    pub fn parse(tag: &str) -> Self {
        let word_end = tag
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(tag.len());
        if word_end == 0 {
            return Self::default();
        }
        let command = tag[..word_end].to_string();

        // Up to two space-separated numbers; anything else ends the match
        let mut numbers = Vec::with_capacity(2);
        let mut rest = &tag[word_end..];
        while numbers.len() < 2 {
            let Some(after_space) = rest.strip_prefix(' ') else {
                break;
            };
            let digits = after_space
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_space.len());
            if digits == 0 {
                break;
            }
            numbers.push(&after_space[..digits]);
            rest = &after_space[digits..];
        }

        let (oid, rows) = match numbers.as_slice() {
            [oid, rows] => (oid.parse().ok(), rows.parse().ok()),
            [rows] => (None, rows.parse().ok()),
            _ => (None, None),
        };

        Self {
            command: Some(command),
            rows,
            oid,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One decoded row.
///
/// Values are stored inline for rows of up to 16 columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[PgValue; 16]>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: SmallVec<[PgValue; 16]>) -> Self {
        Self { columns, values }
    }

    /// Value by column index.
    pub fn get(&self, idx: usize) -> Option<&PgValue> {
        self.values.get(idx)
    }

    /// Value by column name.
    ///
    /// When several columns share the name, the last one wins.
    pub fn get_by_name(&self, name: &str) -> Option<&PgValue> {
        self.columns
            .iter()
            .rposition(|c| c.name == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values.into_vec()
    }
}

impl std::ops::Index<usize> for Row {
    type Output = PgValue;

    fn index(&self, idx: usize) -> &PgValue {
        &self.values[idx]
    }
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Column descriptions, empty for statements that return no rows
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1"); empty for an empty
    /// query or a row-limited execution that stopped early
    pub command_tag: String,
    pub command: Option<String>,
    pub row_count: Option<u64>,
    pub oid: Option<u32>,
}

impl QueryResult {
    pub(crate) fn new(columns: SharedColumns, rows: Vec<Row>, tag: Option<String>) -> Self {
        let parsed = tag.as_deref().map(CommandTag::parse).unwrap_or_default();
        Self {
            columns,
            rows,
            command_tag: tag.unwrap_or_default(),
            command: parsed.command,
            row_count: parsed.rows,
            oid: parsed.oid,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(no_columns(), Vec::new(), None)
    }

    /// Rows affected, or zero when the tag carries no count.
    pub fn rows_affected(&self) -> u64 {
        self.row_count.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
