use std::fmt::Write;

use super::normalize::Metric;

pub const TOTAL_ASSETS: &str = "total_assets";
pub const CURRENT_BALANCE: &str = "current_balance";
pub const CURRENT_VALUE: &str = "current_value";

/// Prometheus text exposition, one sample per metric.
pub fn render_exposition(name: &str, metrics: &[Metric]) -> String {
    let mut out = String::new();
    for metric in metrics {
        let labels = &metric.labels;
        let _ = writeln!(
            out,
            "{name}{{institution=\"{}\", account=\"{}\", account_type=\"{}\", symbol=\"{}\"}} {}",
            escape_label(&labels.institution),
            escape_label(&labels.account),
            escape_label(&labels.account_type),
            escape_label(&labels.symbol),
            format_value(metric.value),
        );
    }
    out
}

/// Same samples preceded by `# HELP` and `# TYPE gauge` lines, as a push
/// gateway expects.
pub fn render_gauge(name: &str, help: &str, metrics: &[Metric]) -> String {
    let mut out = format!("# HELP {name} {}\n# TYPE {name} gauge\n", escape_help(help));
    out.push_str(&render_exposition(name, metrics));
    out
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}
