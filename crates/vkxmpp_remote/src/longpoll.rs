#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use url::Url;
use vkxmpp_domain::{Peer, RemoteId};

use crate::client::{RemoteClient, RemoteMessage};
use crate::error::ApiError;

pub const DEFAULT_POLL_WAIT_SECS: u64 = 25;
pub const DEFAULT_POLL_MARGIN_SECS: u64 = 10;
/// Attachments (2) + extended online events (64).
pub const DEFAULT_POLL_MODE: u32 = 66;

const TAG_NEW_MESSAGE: i64 = 4;
const TAG_USER_JOINED: i64 = 8;
const TAG_USER_LEFT: i64 = 9;
const TAG_TYPING: i64 = 61;

const FLAG_OUTBOX: i64 = 2;

/// Where and how to poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDescriptor {
	pub server: String,
	pub key: String,
	/// Cursor token; advanced on every successful payload.
	pub ts: i64,
	pub wait: u64,
	pub mode: u32,
}

impl PollDescriptor {
	pub fn url(&self) -> Result<Url, url::ParseError> {
		let server = self.server.trim_start_matches("https://").trim_start_matches("http://");
		let mut url = Url::parse(&format!("https://{server}"))?;
		url.query_pairs_mut()
			.append_pair("act", "a_check")
			.append_pair("key", &self.key)
			.append_pair("ts", &self.ts.to_string())
			.append_pair("wait", &self.wait.to_string())
			.append_pair("mode", &self.mode.to_string());
		Ok(url)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
	NewMessage {
		id: i64,
		flags: i64,
		peer: Peer,
		from: RemoteId,
		date: i64,
		subject: String,
		body: String,
		has_attachments: bool,
	},
	UserJoined(RemoteId),
	UserLeft(RemoteId),
	TypingStarted(RemoteId),
	/// Unhandled tag; kept for logging only.
	Other(i64),
}

impl PollEvent {
	/// Plain one-to-one text messages can be delivered straight from the event.
	/// Anything else needs a full `messages.get` pull.
	pub fn as_plain_message(&self) -> Option<RemoteMessage> {
		match self {
			Self::NewMessage {
				id,
				flags,
				peer: peer @ Peer::User(_),
				from,
				date,
				body,
				has_attachments: false,
				..
			} => Some(RemoteMessage {
				id: *id,
				from: *from,
				peer: *peer,
				date: *date,
				out: flags & FLAG_OUTBOX != 0,
				body: body.clone(),
				has_attachments: false,
			}),
			_ => None,
		}
	}

	pub fn is_outgoing(&self) -> bool {
		matches!(self, Self::NewMessage { flags, .. } if flags & FLAG_OUTBOX != 0)
	}
}

/// Classified long-poll payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
	Events { ts: i64, events: Vec<PollEvent> },
	/// Server asked for a fresh descriptor.
	Reinit,
	/// Empty or malformed payload; poll again with no state change.
	Retry,
}

fn as_i64(v: &Value) -> Option<i64> {
	match v {
		Value::Number(n) => n.as_i64(),
		Value::String(s) => s.parse().ok(),
		_ => None,
	}
}

fn parse_event(raw: &Value) -> Option<PollEvent> {
	let arr = raw.as_array()?;
	let (tag, args) = arr.split_first()?;
	let tag = as_i64(tag)?;
	match tag {
		TAG_NEW_MESSAGE => {
			if args.len() != 7 {
				warn!(args = args.len(), "long-poll: unexpected new-message argument count");
				return None;
			}
			let id = as_i64(&args[0])?;
			let flags = as_i64(&args[1])?;
			let raw_peer = as_i64(&args[2])?;
			let date = as_i64(&args[3])?;
			let subject = args[4].as_str().unwrap_or_default().to_string();
			let body = args[5].as_str().unwrap_or_default().to_string();
			let attachments = &args[6];
			let peer = Peer::from_raw(raw_peer);
			let from = match (peer, attachments.get("from").and_then(as_i64)) {
				(Peer::Chat(_), Some(author)) => RemoteId(author),
				_ => RemoteId(raw_peer),
			};
			let has_attachments = attachments
				.as_object()
				.is_some_and(|o| o.keys().any(|k| k.starts_with("attach")));
			Some(PollEvent::NewMessage {
				id,
				flags,
				peer,
				from,
				date,
				subject,
				body,
				has_attachments,
			})
		}
		TAG_USER_JOINED => Some(PollEvent::UserJoined(RemoteId(as_i64(args.first()?)?.abs()))),
		TAG_USER_LEFT => Some(PollEvent::UserLeft(RemoteId(as_i64(args.first()?)?.abs()))),
		TAG_TYPING => Some(PollEvent::TypingStarted(RemoteId(as_i64(args.first()?)?))),
		other => Some(PollEvent::Other(other)),
	}
}

/// Classify one raw payload. Malformed events are logged and dropped.
pub fn parse_payload(body: &str) -> PollOutcome {
	let Ok(data) = serde_json::from_str::<Value>(body) else {
		return PollOutcome::Retry;
	};
	let Some(obj) = data.as_object().filter(|o| !o.is_empty()) else {
		return PollOutcome::Retry;
	};
	if obj.contains_key("failed") {
		return PollOutcome::Reinit;
	}
	let Some(ts) = obj.get("ts").and_then(as_i64) else {
		return PollOutcome::Retry;
	};

	let events = obj
		.get("updates")
		.and_then(Value::as_array)
		.map(|updates| {
			updates
				.iter()
				.filter_map(|raw| {
					let ev = parse_event(raw);
					if ev.is_none() {
						debug!(event = %raw, "long-poll: skipped event");
					}
					ev
				})
				.collect()
		})
		.unwrap_or_default();

	PollOutcome::Events { ts, events }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
	Uninitialized,
	Polling(PollDescriptor),
	/// Captcha pending; the descriptor is kept for resumption.
	Degraded(PollDescriptor),
}

/// Result of one engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
	Events(Vec<PollEvent>),
	/// Poll again right away.
	Retry,
	/// A fresh descriptor is needed; callers should back off first.
	Reinit,
	/// Captcha pending; wait for `RemoteClient::wait_until_unfrozen`.
	Frozen,
	/// The descriptor request failed with an API error the caller must act on.
	Failed(ApiError),
}

/// Per-session long-poll engine.
#[derive(Debug)]
pub struct Poller {
	client: Arc<RemoteClient>,
	state: PollState,
	wait: u64,
	margin: Duration,
}

impl Poller {
	pub fn new(client: Arc<RemoteClient>, wait_secs: u64, margin: Duration) -> Self {
		Self {
			client,
			state: PollState::Uninitialized,
			wait: wait_secs,
			margin,
		}
	}

	pub fn state(&self) -> &PollState {
		&self.state
	}

	pub fn client(&self) -> &Arc<RemoteClient> {
		&self.client
	}

	/// Request a poll-server descriptor. `Ok(false)` when suppressed or frozen.
	pub async fn init_poll(&mut self) -> Result<bool, ApiError> {
		self.state = PollState::Uninitialized;
		if !self.client.ensure_online().await? {
			return Ok(false);
		}
		match self.client.poll_server().await? {
			Some(mut descriptor) => {
				descriptor.wait = self.wait;
				debug!(server = %descriptor.server, "long-poll: descriptor received");
				self.state = PollState::Polling(descriptor);
				Ok(true)
			}
			None => Ok(false),
		}
	}

	pub async fn step(&mut self) -> PollStep {
		if self.client.is_frozen() {
			if let PollState::Polling(d) = &self.state {
				self.state = PollState::Degraded(d.clone());
			}
			return PollStep::Frozen;
		}

		let descriptor = match &self.state {
			PollState::Polling(d) | PollState::Degraded(d) => d.clone(),
			PollState::Uninitialized => match self.init_poll().await {
				Ok(true) => return PollStep::Retry,
				Ok(false) if self.client.is_frozen() => return PollStep::Frozen,
				Ok(false) => return PollStep::Reinit,
				Err(e) => return PollStep::Failed(e),
			},
		};
		self.state = PollState::Polling(descriptor.clone());

		let url = match descriptor.url() {
			Ok(url) => url,
			Err(e) => {
				warn!(error = %e, server = %descriptor.server, "long-poll: bad server address");
				self.state = PollState::Uninitialized;
				return PollStep::Reinit;
			}
		};

		let timeout = Duration::from_secs(descriptor.wait) + self.margin;
		let body = match self.client.transport().poll(&url, timeout).await {
			Ok(body) => body,
			Err(e) => {
				warn!(error = %e, "long-poll: transport error, reinitializing");
				self.state = PollState::Uninitialized;
				return PollStep::Reinit;
			}
		};

		match parse_payload(&body) {
			PollOutcome::Retry => {
				debug!("long-poll: empty payload, polling again");
				PollStep::Retry
			}
			PollOutcome::Reinit => {
				debug!("long-poll: server reported failure, reinitializing");
				self.state = PollState::Uninitialized;
				PollStep::Reinit
			}
			PollOutcome::Events { ts, events } => {
				if let PollState::Polling(d) = &mut self.state {
					d.ts = ts;
				}
				PollStep::Events(events)
			}
		}
	}
}

/// Delay before the next re-init attempt.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}
