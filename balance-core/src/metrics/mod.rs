mod exposition;
mod normalize;
mod table;

pub use exposition::{
    render_exposition, render_gauge, CURRENT_BALANCE, CURRENT_VALUE, TOTAL_ASSETS,
};
pub use normalize::{to_metrics, Metric, MetricColumns, MetricLabels};
pub use table::{Cell, ExtractedTable};
