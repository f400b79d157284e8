use schemahub_metrics::define_metrics;

define_metrics!(
    Ingest => {
        MetricCounter { INGEST_PAGES_COMPLETED, "ingest_pages_completed", "Counter of cursor pages fetched successfully", init = 0 },
        MetricCounter { INGEST_PAGES_REQUEUED, "ingest_pages_requeued", "Counter of cursor pages re-queued after upstream rate limiting", init = 0 },
        MetricCounter { INGEST_RECORDS_WRITTEN, "ingest_records_written", "Counter of raw trade records written to the object store", init = 0 },
        MetricCounter { INGEST_PRODUCT_FAILURES, "ingest_product_failures", "Counter of products whose ingest run errored", init = 0 },
        MetricGauge { INGEST_LAG_SECONDS, "ingest_lag_seconds", "Seconds between the newest flushed trade and wall clock" },
    },
);

pub fn register_metrics() {
    INGEST_PAGES_COMPLETED.register();
    INGEST_PAGES_REQUEUED.register();
    INGEST_RECORDS_WRITTEN.register();
    INGEST_PRODUCT_FAILURES.register();
    INGEST_LAG_SECONDS.register();
}
