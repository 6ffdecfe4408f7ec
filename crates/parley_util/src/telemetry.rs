#![forbid(unsafe_code)]

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber: `RUST_LOG` filter (default
/// `info,<service>=debug`), fmt output and, when `OTEL_EXPORTER_OTLP_ENDPOINT`
/// is set, an OTLP span exporter.
pub fn init_tracing(service: &'static str) {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("info,{service}=debug"));

	let otlp_endpoint = crate::env::env_string("OTEL_EXPORTER_OTLP_ENDPOINT");
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer(service);
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(%endpoint, service, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

/// Install the Prometheus exporter when a bind address is configured.
pub fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match crate::endpoint::HostPort::parse(bind).and_then(|hp| hp.to_socket_addr_if_ip_literal()) {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Test-only fmt subscriber, enabled by `PARLEY_TEST_LOG`.
pub fn init_test_logging() {
	if std::env::var_os("PARLEY_TEST_LOG").is_none() {
		return;
	}

	let _ = tracing_subscriber::fmt()
		.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
		.with_target(false)
		.try_init();
}
