//! Prometheus metrics plumbing.

use std::mem::MaybeUninit;
use std::sync::Once;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

use crate::config::Config;

/// Counter of completed check cycles.
pub const METRIC_CHECK_CYCLES: &str = "buildline_check_cycles_total";
/// Counter of successfully submitted build jobs, labeled by pipeline.
pub const METRIC_BUILDS_SUBMITTED: &str = "buildline_builds_submitted_total";
/// Counter of failed build job submissions, labeled by pipeline.
pub const METRIC_SUBMISSION_ERRORS: &str = "buildline_submission_errors_total";

/// Register this controller's metrics with the global recorder.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_CHECK_CYCLES, metrics::Unit::Count, "completed repository check cycles");
    metrics::register_counter!(METRIC_BUILDS_SUBMITTED, metrics::Unit::Count, "successfully submitted build jobs");
    metrics::register_counter!(METRIC_SUBMISSION_ERRORS, metrics::Unit::Count, "failed build job submissions");
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            RECORDER.write(PrometheusBuilder::new().add_global_label("namespace", config.namespace.clone()).build());
        });
        RECORDER.assume_init_ref()
    }
}
