use time::macros::format_description;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

// Dependencies we always keep at INFO regardless of operator-supplied spec.
const QUIET_LIBS: &[&str] = &["h2", "hyper", "hyper_util", "reqwest"];

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Installs the JSON subscriber on stderr; stdout is reserved for the final
/// run summary.
pub fn configure_tracing() {
    let time_format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    let timer = UtcTime::new(time_format);

    let fmt_layer = fmt::layer()
        .json()
        .with_timer(timer)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .flatten_event(true)
        .with_writer(std::io::stderr);

    let level_filter_layer = QUIET_LIBS.iter().fold(
        EnvFilter::builder().with_default_directive(DEFAULT_LEVEL.into()).from_env_lossy(),
        |layer, lib| layer.add_directive(format!("{lib}=info").parse().expect("Directive parses")),
    );

    tracing_subscriber::registry().with(level_filter_layer).with(fmt_layer).init();
    tracing::info!("Tracing has been successfully initialized.");
}
