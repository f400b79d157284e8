//! Thin wrappers over the `metrics` facade so that every metric in the
//! workspace is declared as a named constant with a description and an
//! explicit registration point, instead of ad-hoc macro calls in hot loops.

/// The component family a metric belongs to. Used for grouping in dashboards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricScope {
    Infra,
    Ingest,
    Transform,
    Upstream,
}

/// Numeric types a gauge accepts, converted with possible precision loss.
pub trait LossyIntoF64 {
    fn into_f64(self) -> f64;
}

macro_rules! impl_lossy_into_f64 {
    ($($ty:ty),*) => {
        $(
            impl LossyIntoF64 for $ty {
                #[allow(clippy::as_conversions)]
                fn into_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_lossy_into_f64!(f64, u64, u32, usize, i64, i32);

#[derive(Clone, Copy, Debug)]
pub struct MetricCounter {
    scope: MetricScope,
    name: &'static str,
    description: &'static str,
    initial_value: u64,
}

impl MetricCounter {
    pub const fn new(
        scope: MetricScope,
        name: &'static str,
        description: &'static str,
        initial_value: u64,
    ) -> Self {
        Self { scope, name, description, initial_value }
    }

    pub const fn get_name(&self) -> &'static str {
        self.name
    }

    pub const fn get_scope(&self) -> MetricScope {
        self.scope
    }

    pub fn register(&self) {
        metrics::counter!(self.name).absolute(self.initial_value);
        metrics::describe_counter!(self.name, self.description);
    }

    pub fn increment(&self, value: u64) {
        metrics::counter!(self.name).increment(value);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MetricGauge {
    scope: MetricScope,
    name: &'static str,
    description: &'static str,
}

impl MetricGauge {
    pub const fn new(scope: MetricScope, name: &'static str, description: &'static str) -> Self {
        Self { scope, name, description }
    }

    pub const fn get_name(&self) -> &'static str {
        self.name
    }

    pub const fn get_scope(&self) -> MetricScope {
        self.scope
    }

    pub fn register(&self) {
        metrics::gauge!(self.name).set(0.0);
        metrics::describe_gauge!(self.name, self.description);
    }

    pub fn set(&self, value: f64) {
        metrics::gauge!(self.name).set(value);
    }

    pub fn set_lossy(&self, value: impl LossyIntoF64) {
        metrics::gauge!(self.name).set(value.into_f64());
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MetricHistogram {
    scope: MetricScope,
    name: &'static str,
    description: &'static str,
}

impl MetricHistogram {
    pub const fn new(scope: MetricScope, name: &'static str, description: &'static str) -> Self {
        Self { scope, name, description }
    }

    pub const fn get_name(&self) -> &'static str {
        self.name
    }

    pub const fn get_scope(&self) -> MetricScope {
        self.scope
    }

    pub fn register(&self) {
        metrics::describe_histogram!(self.name, self.description);
    }

    pub fn record(&self, value: impl LossyIntoF64) {
        metrics::histogram!(self.name).record(value.into_f64());
    }
}

/// Declares metric constants for a crate, grouped by scope:
///
/// ```ignore
/// define_metrics!(
///     Ingest => {
///         MetricCounter { PAGES_FETCHED, "ingest_pages_fetched", "Counter of pages fetched", init = 0 },
///         MetricGauge { QUEUE_DEPTH, "ingest_queue_depth", "Depth of the cursor work queue" },
///         MetricHistogram { PAGE_LATENCY_SECS, "ingest_page_latency_secs", "Page fetch latency (secs)" },
///     },
/// );
/// ```
#[macro_export]
macro_rules! define_metrics {
    ($($scope:ident => { $($rest:tt)* }),+ $(,)?) => {
        $($crate::define_metrics!(@scope $scope; $($rest)*);)+
    };
    (@scope $scope:ident;) => {};
    (@scope $scope:ident;
     MetricCounter { $name:ident, $key:expr, $desc:expr, init = $init:expr }, $($rest:tt)*) => {
        pub const $name: $crate::metrics::MetricCounter = $crate::metrics::MetricCounter::new(
            $crate::metrics::MetricScope::$scope,
            $key,
            $desc,
            $init,
        );
        $crate::define_metrics!(@scope $scope; $($rest)*);
    };
    (@scope $scope:ident;
     MetricGauge { $name:ident, $key:expr, $desc:expr }, $($rest:tt)*) => {
        pub const $name: $crate::metrics::MetricGauge = $crate::metrics::MetricGauge::new(
            $crate::metrics::MetricScope::$scope,
            $key,
            $desc,
        );
        $crate::define_metrics!(@scope $scope; $($rest)*);
    };
    (@scope $scope:ident;
     MetricHistogram { $name:ident, $key:expr, $desc:expr }, $($rest:tt)*) => {
        pub const $name: $crate::metrics::MetricHistogram = $crate::metrics::MetricHistogram::new(
            $crate::metrics::MetricScope::$scope,
            $key,
            $desc,
        );
        $crate::define_metrics!(@scope $scope; $($rest)*);
    };
}
