#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vkxmpp_domain::{ChatId, Peer, RemoteId};

use crate::error::ApiError;
use crate::longpoll::{DEFAULT_POLL_MODE, DEFAULT_POLL_WAIT_SECS, PollDescriptor};
use crate::{RemoteTransport, SecretString};

/// Method used to validate a token.
pub const AUTH_CHECK_METHOD: &str = "isAppUser";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
	/// Dispatch even while a captcha is pending or the client is offline.
	pub force: bool,
	/// Do not attach the access token.
	pub no_token: bool,
}

impl CallOptions {
	pub fn forced() -> Self {
		Self {
			force: true,
			no_token: false,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaInfo {
	pub sid: String,
	pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friend {
	pub name: String,
	pub online: bool,
}

/// A remote message as seen by the synchronizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
	pub id: i64,
	/// Author.
	pub from: RemoteId,
	/// Conversation the message belongs to.
	pub peer: Peer,
	/// Unix seconds.
	pub date: i64,
	pub out: bool,
	pub body: String,
	pub has_attachments: bool,
}

#[derive(Debug, Clone)]
struct PendingCall {
	method: String,
	params: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
	#[serde(default = "Vec::new")]
	items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct FriendItem {
	id: i64,
	#[serde(default)]
	first_name: String,
	#[serde(default)]
	last_name: String,
	#[serde(default)]
	online: u8,
}

#[derive(Debug, Deserialize)]
struct MessageItem {
	id: i64,
	#[serde(default)]
	date: i64,
	#[serde(default)]
	out: u8,
	user_id: i64,
	#[serde(default)]
	body: String,
	#[serde(default)]
	chat_id: Option<i64>,
	#[serde(default)]
	attachments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UserItem {
	id: i64,
	#[serde(default)]
	first_name: String,
	#[serde(default)]
	last_name: String,
}

#[derive(Debug, Deserialize)]
struct PollServerBody {
	server: String,
	key: String,
	ts: Value,
}

fn decode<T: for<'de> Deserialize<'de>>(method: &str, value: Value) -> Result<T, ApiError> {
	serde_json::from_value(value).map_err(|e| ApiError::Malformed(format!("{method}: {e}")))
}

/// Authenticated client for one linked account.
pub struct RemoteClient {
	transport: Arc<dyn RemoteTransport>,
	owner: String,
	token: RwLock<SecretString>,
	api_version: String,
	online: AtomicBool,
	captcha: Mutex<Option<CaptchaInfo>>,
	last_failed: Mutex<Option<PendingCall>>,
	calls: AtomicU64,
	shared_calls: Option<Arc<AtomicU64>>,
	user_id: Mutex<Option<RemoteId>>,
	unfrozen: Notify,
}

impl std::fmt::Debug for RemoteClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RemoteClient")
			.field("owner", &self.owner)
			.field("online", &self.is_online())
			.field("frozen", &self.is_frozen())
			.finish_non_exhaustive()
	}
}

impl RemoteClient {
	pub fn new(
		transport: Arc<dyn RemoteTransport>,
		owner: impl Into<String>,
		token: SecretString,
		api_version: impl Into<String>,
	) -> Self {
		Self {
			transport,
			owner: owner.into(),
			token: RwLock::new(token),
			api_version: api_version.into(),
			online: AtomicBool::new(false),
			captcha: Mutex::new(None),
			last_failed: Mutex::new(None),
			calls: AtomicU64::new(0),
			shared_calls: None,
			user_id: Mutex::new(None),
			unfrozen: Notify::new(),
		}
	}

	/// Also count calls into a process-wide counter.
	pub fn with_shared_counter(mut self, counter: Arc<AtomicU64>) -> Self {
		self.shared_calls = Some(counter);
		self
	}

	pub fn token(&self) -> SecretString {
		self.token.read().clone()
	}

	pub fn set_token(&self, token: SecretString) {
		*self.token.write() = token;
	}

	pub fn is_online(&self) -> bool {
		self.online.load(Ordering::Acquire)
	}

	pub fn set_online_flag(&self, online: bool) {
		self.online.store(online, Ordering::Release);
	}

	pub fn is_frozen(&self) -> bool {
		self.captcha.lock().is_some()
	}

	pub fn captcha(&self) -> Option<CaptchaInfo> {
		self.captcha.lock().clone()
	}

	/// Calls attempted by this client, suppressed ones included.
	pub fn call_count(&self) -> u64 {
		self.calls.load(Ordering::Relaxed)
	}

	pub(crate) fn transport(&self) -> &Arc<dyn RemoteTransport> {
		&self.transport
	}

	fn params(&self, args: &[(&str, String)], no_token: bool) -> Vec<(String, String)> {
		let mut params: Vec<(String, String)> = args.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
		params.push(("v".to_string(), self.api_version.clone()));
		if !no_token {
			params.push(("access_token".to_string(), self.token.read().expose().to_string()));
		}
		params
	}

	/// Run a method through the captcha gate. `Ok(None)` means the call was suppressed.
	pub async fn invoke(&self, method: &str, args: &[(&str, String)], opts: CallOptions) -> Result<Option<Value>, ApiError> {
		self.calls.fetch_add(1, Ordering::Relaxed);
		if let Some(shared) = &self.shared_calls {
			shared.fetch_add(1, Ordering::Relaxed);
		}
		metrics::counter!("vkxmpp_remote_calls_total").increment(1);

		if !opts.force {
			if self.is_frozen() {
				debug!(owner = %self.owner, method, "call suppressed: captcha pending");
				return Ok(None);
			}
			if !self.is_online() {
				debug!(owner = %self.owner, method, "call suppressed: client offline");
				return Ok(None);
			}
		}

		let params = self.params(args, opts.no_token);
		self.dispatch(method, params).await.map(Some)
	}

	async fn dispatch(&self, method: &str, params: Vec<(String, String)>) -> Result<Value, ApiError> {
		match self.transport.call(method, &params).await {
			Ok(v) => Ok(v),
			Err(e) => {
				metrics::counter!("vkxmpp_remote_errors_total").increment(1);
				if let ApiError::CaptchaNeeded { image, sid } = &e {
					*self.captcha.lock() = Some(CaptchaInfo {
						sid: sid.clone(),
						image: image.clone(),
					});
					*self.last_failed.lock() = Some(PendingCall {
						method: method.to_string(),
						params,
					});
				}
				if e.marks_offline() {
					self.set_online_flag(false);
				}
				warn!(owner = %self.owner, method, error = %e, "remote call failed");
				Err(e)
			}
		}
	}

	/// Validate the token with a forced probe. A captcha during the probe is returned as `CaptchaNeeded`.
	pub async fn authenticate(&self) -> Result<(), ApiError> {
		if self.token.read().is_empty() {
			return Err(ApiError::TokenInvalid("empty token".to_string()));
		}
		match self.invoke(AUTH_CHECK_METHOD, &[], CallOptions::forced()).await? {
			Some(_) => {
				self.set_online_flag(true);
				info!(owner = %self.owner, "remote client authenticated");
				Ok(())
			}
			None => Err(ApiError::Malformed(format!("{AUTH_CHECK_METHOD}: empty result"))),
		}
	}

	/// Returns `Ok(false)` while frozen; re-authenticates when offline.
	pub async fn ensure_online(&self) -> Result<bool, ApiError> {
		if self.is_frozen() {
			return Ok(false);
		}
		if self.is_online() {
			return Ok(true);
		}
		self.authenticate().await?;
		Ok(true)
	}

	/// Replay the call that hit the captcha with the user's answer.
	pub async fn solve_captcha(&self, key: &str) -> Result<(), ApiError> {
		let Some(captcha) = self.captcha() else {
			return Ok(());
		};
		let mut call = self.last_failed.lock().take().unwrap_or_else(|| PendingCall {
			method: AUTH_CHECK_METHOD.to_string(),
			params: self.params(&[], false),
		});
		call.params.retain(|(k, _)| k != "captcha_sid" && k != "captcha_key");
		call.params.push(("captcha_sid".to_string(), captcha.sid));
		call.params.push(("captcha_key".to_string(), key.trim().to_string()));

		self.dispatch(&call.method, call.params).await?;
		*self.captcha.lock() = None;
		self.set_online_flag(true);
		self.unfrozen.notify_waiters();
		info!(owner = %self.owner, "captcha solved");
		Ok(())
	}

	/// Resolve once no captcha is pending.
	pub async fn wait_until_unfrozen(&self) {
		loop {
			let notified = self.unfrozen.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if !self.is_frozen() {
				return;
			}
			notified.await;
		}
	}

	/// Wake waiters without solving, e.g. when the session stops.
	pub fn release_waiters(&self) {
		self.unfrozen.notify_waiters();
	}

	pub async fn friends(&self) -> Result<Option<BTreeMap<RemoteId, Friend>>, ApiError> {
		let Some(raw) = self
			.invoke("friends.get", &[("fields", "screen_name".to_string())], CallOptions::default())
			.await?
		else {
			return Ok(None);
		};
		let items: Items<FriendItem> = decode("friends.get", raw)?;
		Ok(Some(
			items
				.items
				.into_iter()
				.map(|f| {
					let name = format!("{} {}", f.first_name, f.last_name).trim().to_string();
					(
						RemoteId(f.id),
						Friend {
							name,
							online: f.online != 0,
						},
					)
				})
				.collect(),
		))
	}

	/// Incoming messages newer than `last_id` (or the latest `count` when `last_id` is zero).
	pub async fn messages(&self, count: u32, last_id: i64) -> Result<Option<Vec<RemoteMessage>>, ApiError> {
		let mut args = vec![("out", "0".to_string()), ("count", count.to_string())];
		if last_id > 0 {
			args.push(("last_message_id", last_id.to_string()));
		} else {
			args.push(("filters", "1".to_string()));
		}
		let Some(raw) = self.invoke("messages.get", &args, CallOptions::default()).await? else {
			return Ok(None);
		};
		let items: Items<MessageItem> = decode("messages.get", raw)?;
		Ok(Some(
			items
				.items
				.into_iter()
				.map(|m| RemoteMessage {
					id: m.id,
					from: RemoteId(m.user_id),
					peer: m.chat_id.map_or(Peer::User(RemoteId(m.user_id)), |c| Peer::Chat(ChatId(c))),
					date: m.date,
					out: m.out != 0,
					body: m.body,
					has_attachments: m.attachments.is_some_and(|a| !a.is_null()),
				})
				.collect(),
		))
	}

	/// The owner's own remote id (cached after the first lookup).
	pub async fn user_id(&self) -> Result<Option<RemoteId>, ApiError> {
		if let Some(id) = *self.user_id.lock() {
			return Ok(Some(id));
		}
		let Some(raw) = self.invoke("users.get", &[], CallOptions::default()).await? else {
			return Ok(None);
		};
		let users: Vec<UserItem> = decode("users.get", raw)?;
		let id = users.first().map(|u| RemoteId(u.id));
		*self.user_id.lock() = id;
		Ok(id)
	}

	/// The owner's `first last` name. Caches the remote id as a side effect.
	pub async fn own_name(&self) -> Result<Option<String>, ApiError> {
		let Some(raw) = self.invoke("users.get", &[], CallOptions::default()).await? else {
			return Ok(None);
		};
		let users: Vec<UserItem> = decode("users.get", raw)?;
		let Some(user) = users.into_iter().next() else {
			return Ok(None);
		};
		*self.user_id.lock() = Some(RemoteId(user.id));
		let name = format!("{} {}", user.first_name, user.last_name).trim().to_string();
		Ok((!name.is_empty()).then_some(name))
	}

	pub async fn send_message(&self, peer: Peer, body: &str) -> Result<Option<i64>, ApiError> {
		let target = match peer {
			Peer::User(id) => ("user_id", id.to_string()),
			Peer::Chat(id) => ("chat_id", id.to_string()),
		};
		let args = [target, ("message", body.to_string()), ("type", "0".to_string())];
		let Some(raw) = self.invoke("messages.send", &args, CallOptions::default()).await? else {
			return Ok(None);
		};
		Ok(raw.as_i64())
	}

	pub async fn set_online(&self) -> Result<(), ApiError> {
		self.invoke("account.setOnline", &[], CallOptions::default()).await?;
		Ok(())
	}

	/// Forced; also clears the local online flag.
	pub async fn set_offline(&self) -> Result<(), ApiError> {
		self.set_online_flag(false);
		self.invoke("account.setOffline", &[], CallOptions::forced()).await?;
		Ok(())
	}

	pub async fn poll_server(&self) -> Result<Option<PollDescriptor>, ApiError> {
		let args = [("use_ssl", "1".to_string()), ("need_pts", "0".to_string())];
		let Some(raw) = self.invoke("messages.getLongPollServer", &args, CallOptions::default()).await? else {
			return Ok(None);
		};
		let body: PollServerBody = decode("messages.getLongPollServer", raw)?;
		let ts = match &body.ts {
			Value::Number(n) => n.as_i64(),
			Value::String(s) => s.parse().ok(),
			_ => None,
		}
		.ok_or_else(|| ApiError::Malformed("messages.getLongPollServer: bad ts".to_string()))?;
		Ok(Some(PollDescriptor {
			server: body.server,
			key: body.key,
			ts,
			wait: DEFAULT_POLL_WAIT_SECS,
			mode: DEFAULT_POLL_MODE,
		}))
	}
}
