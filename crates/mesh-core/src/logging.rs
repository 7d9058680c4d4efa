//! Logging initialization using the `tracing` ecosystem.
//!
//! Provides:
//! - Console output (colored human-readable, or JSON lines)
//! - File output (daily rotation via `tracing-appender`)
//! - Configurable log level via env var `RUST_LOG` or explicit parameter
//!
//! Fabric events carry structured fields (`agent`, `role`, `addr`, `topic`)
//! so JSON output can be shipped to an external sink unchanged.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Default level if `RUST_LOG` is not set (e.g. `"info"`).
    pub level: &'a str,
    /// Optional directory for daily-rotating log files.
    pub dir: Option<&'a str>,
    /// Used as the log file prefix (e.g. `"mesh-runner"`).
    pub file_prefix: &'a str,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, json: bool, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        layer.json().boxed()
    } else {
        layer.with_ansi(ansi).boxed()
    }
}

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start. A second call leaves the first
/// subscriber in place and reports the conflict on stderr.
pub fn init_logging(opts: &LogOptions<'_>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(std::io::stdout, opts.json, true)];
    if let Some(dir) = opts.dir {
        let file_appender = tracing_appender::rolling::daily(dir, opts.file_prefix);
        layers.push(fmt_layer(file_appender, opts.json, false));
    }

    if let Err(e) = tracing_subscriber::registry().with(layers).with(env_filter).try_init() {
        eprintln!("logging already initialized: {e}");
    }
}
