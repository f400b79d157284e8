use schemahub_metrics::define_metrics;

define_metrics!(
    Upstream => {
        MetricCounter { CIRCUIT_OPENED, "upstream_circuit_opened", "Counter of circuit open transitions", init = 0 },
        MetricGauge { CIRCUIT_STATE, "upstream_circuit_state", "Circuit state (0 closed, 1 half-open, 2 open)" },
        MetricGauge { UPSTREAM_ERROR_RATE, "upstream_error_rate", "Error rate over the rolling request window" },
    },
);

pub fn register_metrics() {
    CIRCUIT_OPENED.register();
    CIRCUIT_STATE.register();
    UPSTREAM_ERROR_RATE.register();
}
