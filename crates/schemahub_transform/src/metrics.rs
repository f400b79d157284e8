use schemahub_metrics::define_metrics;

define_metrics!(
    Transform => {
        MetricCounter { TRANSFORM_RECORDS_READ, "transform_records_read", "Counter of raw records read from the object store", init = 0 },
        MetricCounter { TRANSFORM_RECORDS_TRANSFORMED, "transform_records_transformed", "Counter of records projected onto the unified schema", init = 0 },
        MetricCounter { TRANSFORM_RECORDS_SKIPPED, "transform_records_skipped", "Counter of raw records dropped by projection failures", init = 0 },
        MetricCounter { TRANSFORM_RECORDS_WRITTEN, "transform_records_written", "Counter of unified records written to columnar pages", init = 0 },
        MetricCounter { DEDUPE_DUPLICATES_REMOVED, "dedupe_duplicates_removed", "Counter of duplicate rows removed from version partitions", init = 0 },
        MetricCounter { QUALITY_GATE_FAILURES, "quality_gate_failures", "Counter of transform runs that failed the quality gate", init = 0 },
    },
);

pub fn register_metrics() {
    TRANSFORM_RECORDS_READ.register();
    TRANSFORM_RECORDS_TRANSFORMED.register();
    TRANSFORM_RECORDS_SKIPPED.register();
    TRANSFORM_RECORDS_WRITTEN.register();
    DEDUPE_DUPLICATES_REMOVED.register();
    QUALITY_GATE_FAILURES.register();
}
