use schemahub_metrics::define_metrics;

define_metrics!(
    Infra => {
        MetricCounter { LOCKS_ACQUIRED, "locks_acquired", "Counter of leases acquired", init = 0 },
        MetricCounter { LOCKS_STOLEN, "locks_stolen", "Counter of expired leases taken over from a dead holder", init = 0 },
        MetricCounter { LOCK_RENEWAL_FAILURES, "lock_renewal_failures", "Counter of renewals that found the lease lost", init = 0 },
        MetricGauge { LOCKS_HELD, "locks_held", "Number of leases currently held by this process" },
    },
);

pub fn register_metrics() {
    LOCKS_ACQUIRED.register();
    LOCKS_STOLEN.register();
    LOCK_RENEWAL_FAILURES.register();
    LOCKS_HELD.register();
}
