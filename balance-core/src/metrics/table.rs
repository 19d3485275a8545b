use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single scraped cell. Text cells such as `"$1,234.56"` can still be read
/// as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            Cell::Text(text) => parse_amount(text),
        }
    }

    /// Label rendering; integral numbers drop the fractional part.
    pub fn as_label(&self) -> String {
        match self {
            Cell::Number(value) => value.to_string(),
            Cell::Text(text) => text.trim().to_string(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_label())
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

fn amount_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(-)?\s*[$€£¥]?\s*(-)?\s*((?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?|\.\d+)$").ok()
        })
        .as_ref()
}

/// Plain, currency or thousands-separated amounts. `(55.10)` reads as
/// `-55.10`; anything else is not an amount.
fn parse_amount(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let (inner, parenthesized) = match trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(inner) => (inner.trim(), true),
        None => (trimmed, false),
    };
    let captures = amount_pattern()?.captures(inner)?;
    let digits = captures.get(3)?.as_str().replace(',', "");
    let value: f64 = digits.parse().ok()?;
    let negative = parenthesized || captures.get(1).is_some() || captures.get(2).is_some();
    Some(if negative { -value } else { value })
}

/// One table lifted off an account page: named columns and rows keyed by
/// column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<BTreeMap<String, Cell>>,
}

impl ExtractedTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a row; cells pair with `columns` positionally.
    pub fn row<I, C>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Cell>,
    {
        let row = self
            .columns
            .iter()
            .cloned()
            .zip(cells.into_iter().map(Into::into))
            .collect();
        self.rows.push(row);
        self
    }

    /// Declared columns, or the keys seen across rows when none were declared.
    pub fn column_names(&self) -> Vec<&str> {
        if !self.columns.is_empty() {
            return self.columns.iter().map(String::as_str).collect();
        }
        let mut names: Vec<&str> = self
            .rows
            .iter()
            .flat_map(|row| row.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn has_columns(&self, required: &[&str]) -> bool {
        let names = self.column_names();
        required.iter().all(|column| names.contains(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_amounts_parse_as_numbers() {
        assert_eq!(Cell::from("$1,234.56").as_f64(), Some(1234.56));
        assert_eq!(Cell::from("-$20.00").as_f64(), Some(-20.0));
        assert_eq!(Cell::from("n/a").as_f64(), None);
        assert_eq!(Cell::from(7.5).as_f64(), Some(7.5));
    }

    #[test]
    fn accounting_negatives_keep_their_sign() {
        assert_eq!(Cell::from("(55.10)").as_f64(), Some(-55.1));
        assert_eq!(Cell::from("($1,000)").as_f64(), Some(-1000.0));
        assert_eq!(Cell::from("$-3.50").as_f64(), Some(-3.5));
        assert_eq!(Cell::from(" 42 ").as_f64(), Some(42.0));
        assert_eq!(Cell::from("€.75").as_f64(), Some(0.75));
    }

    #[test]
    fn text_that_merely_contains_digits_is_not_an_amount() {
        assert_eq!(Cell::from("Pending (2 items)").as_f64(), None);
        assert_eq!(Cell::from("12/31/2024").as_f64(), None);
        assert_eq!(Cell::from("1,23").as_f64(), None);
        assert_eq!(Cell::from("").as_f64(), None);
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(Cell::from(1.0).as_label(), "1");
        assert_eq!(Cell::from(2.5).as_label(), "2.5");
        assert_eq!(Cell::from(" checking ").as_label(), "checking");
    }

    #[test]
    fn columns_fall_back_to_row_keys() {
        let table: ExtractedTable = serde_json::from_str(
            r#"{"rows": [{"account": "1", "balance": 10.0}, {"account": "2", "symbol": "USD"}]}"#,
        )
        .unwrap();
        assert_eq!(table.column_names(), vec!["account", "balance", "symbol"]);
        assert!(table.has_columns(&["account", "symbol"]));
        assert!(!table.has_columns(&["account_type"]));
    }
}
