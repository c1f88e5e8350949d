use std::sync::LazyLock;

use indicatif::ProgressStyle;

/// Style of the overall deployment progress bar.
pub(crate) static STYLE_DEPLOYMENT: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

/// Style of a single in-flight action.
pub(crate) static STYLE_ACTION: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Environment variable holding the log filter directives.
#[cfg(feature = "logging")]
pub const LOG_ENV: &str = "KIDOU_LOG";

/// Installs a global `tracing` subscriber printing events to stderr, with
/// progress bars drawn by `tracing-indicatif`. The filter is read from
/// `KIDOU_LOG` and defaults to `info`.
///
/// Does nothing if a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing::level_filters::LevelFilter;
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let indicatif = IndicatifLayer::new();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init();
}
