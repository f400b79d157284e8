use schemahub_metrics::define_metrics;

define_metrics!(
    Upstream => {
        MetricCounter { UPSTREAM_REQUESTS, "upstream_requests", "Counter of page requests sent upstream", init = 0 },
        MetricCounter { UPSTREAM_RETRIES, "upstream_retries", "Counter of retried upstream attempts", init = 0 },
        MetricHistogram { UPSTREAM_REQUEST_LATENCY_SECS, "upstream_request_latency_secs", "Upstream request latency (secs)" },
    },
);

pub fn register_metrics() {
    UPSTREAM_REQUESTS.register();
    UPSTREAM_RETRIES.register();
    UPSTREAM_REQUEST_LATENCY_SECS.register();
}
