use std::env;

use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: env-filtered stdout logging, plus span
/// export to a Jaeger collector when `jaeger_endpoint` is given.
pub fn init(jaeger_endpoint: Option<&str>) -> anyhow::Result<()> {
    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            env::remove_var("http_proxy");
            env::remove_var("https_proxy");
            env::remove_var("HTTP_PROXY");
            env::remove_var("HTTPS_PROXY");

            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("mediaq")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

/// Flushes pending spans. Harmless when no exporter was installed.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
