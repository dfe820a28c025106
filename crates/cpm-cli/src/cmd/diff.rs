//! `cpm diff` - packet semantic diff and drift report.

use cpm_core::retrieve::diff_packets;

use crate::app::CpmApp;
use crate::cmd::query::resolve_packet_dir;
use crate::output;

pub fn run(app: &CpmApp, left: &str, right: &str, max_drift: Option<f64>) -> i32 {
    let left_dir = match resolve_packet_dir(app, left, None) {
        Ok((dir, _)) => dir,
        Err(e) => {
            output::error_line("diff", format!("unable to resolve left ref: {e}"), None);
            return 1;
        }
    };
    let right_dir = match resolve_packet_dir(app, right, None) {
        Ok((dir, _)) => dir,
        Err(e) => {
            output::error_line("diff", format!("unable to resolve right ref: {e}"), None);
            return 1;
        }
    };

    let report = match diff_packets(&left_dir, &right_dir, max_drift) {
        Ok(report) => report,
        Err(e) => {
            output::error_line("diff", e.to_string(), None);
            return 1;
        }
    };

    if output::is_json() {
        let _ = output::print_json(&report);
        return i32::from(!report.ok);
    }

    output::line("diff", format!("left={}", report.left));
    output::line("diff", format!("right={}", report.right));
    output::line(
        "diff",
        format!(
            "added={} removed={} changed={}",
            report.added.len(),
            report.removed.len(),
            report.changed.len()
        ),
    );
    output::line(
        "diff",
        format!(
            "drift_score={} delta_ndcg_proxy={}",
            report
                .drift_score
                .map(|d| format!("{d:.6}"))
                .unwrap_or_else(|| "-".to_string()),
            report.delta_ndcg_proxy
        ),
    );
    if let Some(error) = &report.error {
        output::error_line("diff", format!("error={error}"), None);
        return 1;
    }
    0
}
