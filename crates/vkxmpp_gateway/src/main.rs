#![forbid(unsafe_code)]

mod config;
mod context;
mod gateway;
mod groupchat;
mod health;
mod session;
mod stats;
mod store;
mod sync;
mod text;
mod xmpp;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vkxmpp_domain::JidMap;
use vkxmpp_remote::{HttpTransport, RemoteTransport};

use crate::config::{GatewayConfig, RestartMode};
use crate::context::Context;
use crate::gateway::{Gateway, SHUTDOWN_REASON};
use crate::health::{HealthState, spawn_health_server};
use crate::stats::Stats;
use crate::store::{AccountStore, InMemoryStore, SqlStore};
use crate::xmpp::component::{self, ComponentConnection};

/// Exit status asking a supervisor to restart the process.
const EXIT_RESTART: i32 = 3;
const TERMINATE_REASON: &str = "Shutting down by SIGTERM";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: vkxmpp_gateway [--config <path>] [--daemon]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.vkxmpp/config.toml)\n\
\t--daemon  Exit with status 3 on disconnect instead of reconnecting\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	daemon: bool,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		daemon: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--daemon" | "-d" => args.daemon = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vkxmpp_gateway=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
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
				let tracer = tracer_provider.tracer("vkxmpp_gateway");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
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

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
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

/// Resolves with the presence status to send once SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> &'static str {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut term) => tokio::select! {
				_ = tokio::signal::ctrl_c() => SHUTDOWN_REASON,
				_ = term.recv() => TERMINATE_REASON,
			},
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler");
				let _ = tokio::signal::ctrl_c().await;
				SHUTDOWN_REASON
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		SHUTDOWN_REASON
	}
}

enum Ended {
	Shutdown,
	Disconnected,
}

/// Shared by every component connection of the process.
struct Runtime {
	cfg: GatewayConfig,
	jids: JidMap,
	store: Arc<dyn AccountStore>,
	transport: Arc<dyn RemoteTransport>,
	stats: Arc<Stats>,
	health: HealthState,
}

async fn run_connection(rt: &Runtime) -> anyhow::Result<Ended> {
	let ComponentConnection { sink, mut inbound } = component::connect(&rt.cfg.component)
		.await
		.context("component connection failed")?;

	let ctx = Arc::new(Context::new(
		rt.jids.clone(),
		sink.clone(),
		Arc::clone(&rt.store),
		Arc::clone(&rt.stats),
	));
	let gateway = Gateway::new(
		ctx,
		Arc::clone(&rt.transport),
		rt.cfg.remote.clone(),
		rt.cfg.sessions,
		rt.cfg.component.conference_domain.as_deref(),
	);
	gateway.start().await.context("gateway startup failed")?;
	rt.health.mark_ready();
	info!(jid = %rt.cfg.component.jid, "gateway online");

	let stop = shutdown_signal();
	tokio::pin!(stop);
	loop {
		tokio::select! {
			reason = &mut stop => {
				info!(reason, "shutdown requested");
				gateway.shutdown(reason).await;
				sink.close().await;
				return Ok(Ended::Shutdown);
			}
			_ = sink.wait_closed() => {
				gateway.disconnect();
				return Ok(Ended::Disconnected);
			}
			stanza = inbound.recv() => match stanza {
				Some(stanza) => gateway.dispatch(stanza).await,
				None => {
					gateway.disconnect();
					return Ok(Ended::Disconnected);
				}
			},
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_gateway_config_from_path(&config_path)?;
	if args.daemon {
		cfg.component.restart_mode = RestartMode::Exit;
	}
	info!(path = %config_path.display(), "loaded gateway config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let stats = Arc::new(Stats::default());
	let health = HealthState::new(Arc::clone(&stats));
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store: Arc<dyn AccountStore> = match cfg.persistence.database_url.as_deref() {
		Some(url) => Arc::new(SqlStore::connect(url, cfg.persistence.max_connections).await?),
		None => {
			warn!("no database_url configured; linked accounts are kept in memory only");
			Arc::new(InMemoryStore::default())
		}
	};
	let transport: Arc<dyn RemoteTransport> = Arc::new(HttpTransport::new(&cfg.remote.api_base_url)?);
	let jids = JidMap::new(cfg.component.jid.clone()).context("invalid component jid")?;

	let rt = Runtime {
		cfg,
		jids,
		store,
		transport,
		stats,
		health,
	};

	loop {
		match run_connection(&rt).await {
			Ok(Ended::Shutdown) => {
				info!("gateway stopped");
				return Ok(());
			}
			Ok(Ended::Disconnected) => {
				error!(stats = ?rt.stats.snapshot(), "component connection lost");
			}
			Err(e) => {
				error!(error = %format!("{e:#}"), "component connection failed");
			}
		}
		rt.health.mark_not_ready();
		metrics::counter!("vkxmpp_disconnects_total").increment(1);

		match rt.cfg.component.restart_mode {
			RestartMode::Exit => {
				error!(status = EXIT_RESTART, "exiting for supervisor restart");
				std::process::exit(EXIT_RESTART);
			}
			RestartMode::Reconnect => {
				let delay = rt.cfg.component.restart_delay;
				info!(delay_ms = delay.as_millis() as u64, "reconnecting");
				tokio::select! {
					_ = shutdown_signal() => return Ok(()),
					_ = tokio::time::sleep(delay) => {}
				}
			}
		}
	}
}
