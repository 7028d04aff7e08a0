#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::stats::Stats;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	stats: Arc<Stats>,
}

impl HealthState {
	pub fn new(stats: Arc<Stats>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			stats,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	/// The component link dropped; back to not-ready until it reconnects.
	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if *method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/stats" => match serde_json::to_vec(&state.stats.snapshot()) {
			Ok(body) => {
				let mut resp = respond(StatusCode::OK, body);
				resp.headers_mut()
					.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Err(e) => {
				warn!(error = %e, "stats serialization failed");
				respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::BodyExt;

	async fn body_of(resp: Response<Full<Bytes>>) -> Bytes {
		resp.into_body().collect().await.unwrap().to_bytes()
	}

	#[tokio::test]
	async fn readiness_follows_state() {
		let state = HealthState::new(Arc::new(Stats::default()));
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);
		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
		state.mark_not_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn stats_are_json() {
		let stats = Arc::new(Stats::default());
		stats.incoming();
		stats.incoming();
		stats.set_sessions_online(3);
		let state = HealthState::new(stats);

		let resp = route(&Method::GET, "/stats", &state);
		assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
		let v: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
		assert_eq!(v["msg_in"], 2);
		assert_eq!(v["sessions_online"], 3);
	}
}
