use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::browser::{ScrapeError, ScrapeResult};

use super::table::ExtractedTable;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricLabels {
    pub institution: String,
    pub account: String,
    pub account_type: String,
    pub symbol: String,
}

impl MetricLabels {
    pub fn as_array(&self) -> [&str; 4] {
        [
            &self.institution,
            &self.account,
            &self.account_type,
            &self.symbol,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub labels: MetricLabels,
    pub value: f64,
}

/// Which source columns feed each label and the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumns {
    pub account: String,
    pub symbol: String,
    pub value: String,
    pub account_type: String,
}

impl MetricColumns {
    pub fn new(
        account: impl Into<String>,
        symbol: impl Into<String>,
        value: impl Into<String>,
        account_type: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            symbol: symbol.into(),
            value: value.into(),
            account_type: account_type.into(),
        }
    }

    /// Same label columns, different value column (balances vs. USD values).
    pub fn with_value(&self, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..self.clone()
        }
    }

    fn required(&self) -> [&str; 4] {
        [&self.account, &self.symbol, &self.value, &self.account_type]
    }
}

/// Flattens every table carrying all four columns into one metric per row.
/// Tables missing a column are skipped; an empty result is an error.
pub fn to_metrics(
    tables: &[ExtractedTable],
    institution: &str,
    columns: &MetricColumns,
) -> ScrapeResult<Vec<Metric>> {
    let required = columns.required();
    let mut metrics = Vec::new();
    for (index, table) in tables.iter().enumerate() {
        if !table.has_columns(&required) {
            debug!(
                institution,
                table = table.name.as_deref().unwrap_or("unnamed"),
                index,
                "skipping table without required columns"
            );
            continue;
        }
        for (row_index, row) in table.rows.iter().enumerate() {
            let label = |column: &str| {
                row.get(column)
                    .map(|cell| cell.as_label())
                    .unwrap_or_default()
            };
            let value = row
                .get(&columns.value)
                .and_then(|cell| cell.as_f64())
                .ok_or_else(|| {
                    ScrapeError::Assertion(format!(
                        "{institution} table {index} row {row_index}: column {} is not numeric",
                        columns.value
                    ))
                })?;
            metrics.push(Metric {
                labels: MetricLabels {
                    institution: institution.to_string(),
                    account: label(&columns.account),
                    account_type: label(&columns.account_type),
                    symbol: label(&columns.symbol),
                },
                value,
            });
        }
    }
    if metrics.is_empty() {
        return Err(ScrapeError::EmptyMetricSet(institution.to_string()));
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Cell;

    fn columns() -> MetricColumns {
        MetricColumns::new("account", "symbol", "balance", "account_type")
    }

    #[test]
    fn single_row_becomes_one_metric() {
        let table = ExtractedTable::new(["account", "account_type", "symbol", "balance"]).row([
            Cell::from("1"),
            Cell::from("deposit"),
            Cell::from("USD"),
            Cell::from(100.0),
        ]);
        let metrics = to_metrics(&[table], "Bank", &columns()).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].labels.as_array(), ["Bank", "1", "deposit", "USD"]);
        assert_eq!(metrics[0].value, 100.0);
    }

    #[test]
    fn tables_missing_a_column_are_skipped() {
        let deposits = ExtractedTable::new(["account", "account_type", "symbol", "balance"])
            .row(["1", "deposit", "USD", "$10.00"])
            .row(["2", "deposit", "USD", "$20.50"])
            .row(["3", "savings", "USD", "1,000"]);
        let credit = ExtractedTable::new(["account", "account_type", "balance"])
            .row(["4", "credit", "-$55.10"]);
        let metrics = to_metrics(&[deposits, credit], "Chase", &columns()).unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(
            metrics.iter().map(|metric| metric.value).collect::<Vec<_>>(),
            vec![10.0, 20.5, 1000.0]
        );
    }

    #[test]
    fn nothing_usable_is_an_empty_metric_set() {
        let credit = ExtractedTable::new(["account", "balance"]).row(["4", "12"]);
        let err = to_metrics(&[credit], "Chase", &columns()).unwrap_err();
        assert!(matches!(err, ScrapeError::EmptyMetricSet(ref name) if name == "Chase"));
        assert!(matches!(
            to_metrics(&[], "Chase", &columns()),
            Err(ScrapeError::EmptyMetricSet(_))
        ));
    }

    #[test]
    fn non_numeric_value_fails_assertion() {
        let table = ExtractedTable::new(["account", "account_type", "symbol", "balance"])
            .row(["1", "deposit", "USD", "pending"]);
        let err = to_metrics(&[table], "Bank", &columns()).unwrap_err();
        assert!(matches!(err, ScrapeError::Assertion(ref message) if message.contains("balance")));
    }

    #[test]
    fn value_column_can_be_swapped() {
        let table = ExtractedTable::new(["account", "account_type", "symbol", "balance", "usd"])
            .row(["1", "brokerage", "VTI", "12", "2400.00"]);
        let usd = to_metrics(&[table], "Vanguard", &columns().with_value("usd")).unwrap();
        assert_eq!(usd[0].value, 2400.0);
        assert_eq!(usd[0].labels.symbol, "VTI");
    }
}
