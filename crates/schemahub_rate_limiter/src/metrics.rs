use schemahub_metrics::define_metrics;

define_metrics!(
    Infra => {
        MetricCounter { RATE_LIMITER_TOKENS_GRANTED, "rate_limiter_tokens_granted", "Counter of tokens handed out by the rate limiter", init = 0 },
        MetricCounter { RATE_LIMITER_REJECTIONS, "rate_limiter_rejections", "Counter of non-blocking acquires that found no token", init = 0 },
        MetricHistogram { RATE_LIMITER_WAIT_SECS, "rate_limiter_wait_secs", "Time callers spent waiting for a token (secs)" },
    },
);

pub fn register_metrics() {
    RATE_LIMITER_TOKENS_GRANTED.register();
    RATE_LIMITER_REJECTIONS.register();
    RATE_LIMITER_WAIT_SECS.register();
}
