//! Human-readable formatting of speed samples and run results.

use serde::Serialize;

/// What a client saw over one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// `speed` values in arrival order.
    pub samples: Vec<f64>,
    /// The `final` average reported by the server.
    pub average: f64,
}

impl RunSummary {
    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }
}

/// Format a speed in Mbps, switching to Gbps at 1000.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One-line summary of a run.
pub fn format_summary(summary: &RunSummary) -> String {
    let count = summary.samples.len();
    let mut line = format!(
        "average {} over {} sample{}",
        format_speed(summary.average),
        count,
        if count == 1 { "" } else { "s" },
    );

    if let (Some(min), Some(max)) = (summary.min(), summary.max()) {
        line.push_str(&format!(
            " (min {}, max {})",
            format_speed(min),
            format_speed(max)
        ));
    }

    line
}
