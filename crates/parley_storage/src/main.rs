#![forbid(unsafe_code)]

mod config;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use parley_stream::{Consumer, ConsumerConfig, PersistentStreamBackend, StreamBackend};
use parley_util::lifecycle::Supervisor;
use tokio::net::TcpListener;
use tracing::info;

use crate::storage::directory::DirectoryService;
use crate::storage::processor::Processor;
use crate::storage::store::{MessageStore, SqlMessageStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_storage [--config path] [--bind host:port]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.parley/storage.toml)\n\
\t--bind    Directory listener bind address (default: 127.0.0.1:8000)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args { config: None, bind: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	parley_util::telemetry::init_tracing("parley_storage");

	let args = parse_args();
	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_storage_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded storage config (toml + env overrides)");

	parley_util::telemetry::init_metrics(cfg.server.metrics_bind.as_deref());

	let bind = cfg.bind_addr().context("invalid storage bind address")?;

	let store: Arc<dyn MessageStore> = Arc::new(
		SqlMessageStore::connect(&cfg.store.database_url)
			.await
			.context("connect message store")?,
	);
	let stream_backend: Arc<dyn StreamBackend> = Arc::new(
		PersistentStreamBackend::connect(&cfg.stream.database_url)
			.await
			.context("connect stream log")?,
	);

	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind directory listener on {bind}"))?;

	let supervisor = Supervisor::new();

	let (consumer, records, committer) = Consumer::new(
		stream_backend,
		ConsumerConfig {
			topic: cfg.stream.topic.clone(),
			group_id: cfg.stream.group_id.clone(),
			poll_interval: cfg.stream.poll_interval,
			lease_ttl: cfg.stream.lease_ttl,
		},
	);
	let token = supervisor.token();
	supervisor.spawn("stream_consumer", async move {
		consumer.run(token).await.context("stream consumer")
	});

	let processor = Processor::new(Arc::clone(&store), committer);
	let token = supervisor.token();
	supervisor.spawn("stream_processor", processor.run(records, token));

	let service = DirectoryService::new(store);
	let grace = cfg.server.shutdown_grace;
	supervisor.spawn_drainable(
		"directory_listener",
		parley_util::http::serve(
			listener,
			move |req, remote| {
				let service = service.clone();
				async move { service.route(req, remote).await }
			},
			supervisor.drain_token(),
			grace,
		),
	);

	info!(%bind, "parley_storage ready");
	supervisor.run_until_shutdown(grace).await
}
