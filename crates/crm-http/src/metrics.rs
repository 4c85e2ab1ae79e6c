//! Request metrics
//!
//! Emitted through the `metrics` facade; without an installed recorder the
//! calls are no-ops.
//!
//! - `crm_http_requests_total` (counter): labels `method`, `status`
//! - `crm_http_request_duration_seconds` (histogram): labels `method`, `status`
//! - `crm_http_errors_total` (counter): labels `method`, `kind`
//! - `crm_http_retries_total` (counter): label `method`
//! - `crm_http_active_requests` (gauge)

pub const REQUEST_DURATION_METRIC: &str = "crm_http_request_duration_seconds";

/// Histogram buckets for request durations, 5ms to 60s.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Record a completed attempt that produced an HTTP status.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("crm_http_requests_total", "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION_METRIC, "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

/// Record a failed attempt, labelled with the error kind.
pub fn record_error(method: &str, kind: &'static str) {
    metrics::counter!("crm_http_errors_total", "method" => method.to_string(), "kind" => kind)
        .increment(1);
}

pub fn record_retry(method: &str) {
    metrics::counter!("crm_http_retries_total", "method" => method.to_string()).increment(1);
}

pub fn set_active_requests(active: usize) {
    metrics::gauge!("crm_http_active_requests").set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{
        Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
    };

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("GET", 200, 0.05);
        record_error("GET", "request");
        record_retry("GET");
        set_active_requests(0);
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(REQUEST_DURATION_METRIC.to_string()),
                DURATION_BUCKETS,
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn request_counter_and_histogram_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("GET", 200, 0.042);
        record_request("POST", 503, 1.5);

        let output = handle.render();
        assert!(output.contains("crm_http_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"POST\""));
        assert!(output.contains("crm_http_request_duration_seconds_bucket"));
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn errors_and_retries_are_counted() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_error("GET", "rate_limit");
        record_retry("GET");
        record_retry("GET");
        set_active_requests(3);

        let output = handle.render();
        assert!(output.contains("crm_http_errors_total"));
        assert!(output.contains("kind=\"rate_limit\""));
        assert!(output.contains("crm_http_retries_total{method=\"GET\"} 2"));
        assert!(output.contains("crm_http_active_requests 3"));
    }
}
