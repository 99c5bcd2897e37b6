//! Logging setup and per-request trace correlation.
//!
//! `init_tracing` installs the global subscriber once, formatted and filtered
//! by `BROKER_LOG_FORMAT` and `BROKER_LOG_LEVEL` (`RUST_LOG` wins when set),
//! and bridges `log::` macros from dependencies into tracing. A task-local
//! trace context carries the trace id that problem responses echo back to
//! callers.

use std::sync::Once;

use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Metadata scoped to one in-flight request.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

static INIT: Once = Once::new();

/// Installs the global tracing subscriber and the `log` bridge.
///
/// Only the first call takes effect; later calls are no-ops so test binaries
/// that boot several servers stay quiet. Installation failures are reported
/// on stderr rather than aborting startup.
pub fn init_tracing(config: &AppConfig) {
    INIT.call_once(|| {
        if let Err(err) = LogTracer::builder()
            .with_max_level(log::LevelFilter::Trace)
            .init()
        {
            eprintln!("log bridge not installed: {err}");
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

        let format_layer = match config.log_format.as_str() {
            "pretty" => fmt::layer().pretty().boxed(),
            _ => fmt::layer().json().boxed(),
        };

        if let Err(err) = tracing_subscriber::registry()
            .with(filter)
            .with(format_layer)
            .try_init()
        {
            eprintln!("tracing subscriber not installed: {err}");
        }
    });
}

/// Runs `future` with `context` installed as the task's trace context.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Trace id of the current request, when one is installed.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|context| context.trace_id.clone())
        .ok()
}
