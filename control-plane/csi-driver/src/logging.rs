//! Tracing subscriber setup shared by the plugin binaries.
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty style.
    Pretty,
    /// JSON style.
    Json,
}

/// Filter used when `RUST_LOG` is not set: one more level of detail per verbosity step,
/// with the transport crates kept quiet.
pub fn default_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("{level},h2=info,hyper=info,tower=info,kube_client=info")
}

/// Install the global subscriber for `service_name`.
pub fn init_tracing(service_name: &str, style: FmtStyle, verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));
    let subscriber = Registry::default().with(filter);
    let stdout = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    match style {
        FmtStyle::Compact => subscriber.with(stdout.compact()).init(),
        FmtStyle::Pretty => subscriber.with(stdout.pretty()).init(),
        FmtStyle::Json => subscriber.with(stdout.json()).init(),
    }
    tracing::info!(
        service = service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Tracing initialized"
    );
}
