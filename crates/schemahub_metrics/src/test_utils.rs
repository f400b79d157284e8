use std::str::FromStr;

use num_traits::Num;
use regex::{escape, Regex};

/// Parses a numeric metric value out of rendered Prometheus text.
///
/// Matches `metric_name <number>` lines; returns `None` when the metric is
/// absent or fails to parse into `T`.
pub fn parse_numeric_metric<T: Num + FromStr>(
    metrics_as_string: &str,
    metric_name: &str,
) -> Option<T> {
    let pattern = format!(r"(?m)^{}\s+([0-9]+(?:\.[0-9]+)?)", escape(metric_name));
    let re = Regex::new(&pattern).expect("Invalid regex");
    let captures = re.captures(metrics_as_string)?;
    captures.get(1)?.as_str().parse().ok()
}
