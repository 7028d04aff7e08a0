#![forbid(unsafe_code)]

pub mod commands;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vkxmpp_domain::{AccountId, Peer, RoomJid, split_jid};
use vkxmpp_remote::{ApiError, ErrorPolicy, PollEvent, RemoteClient, RemoteTransport};

use crate::config::{RemoteSettings, SessionDefaults};
use crate::context::Context;
use crate::groupchat::{Flow, GroupchatBridge, GroupchatHandler};
use crate::session::{Session, SessionSettings};
use crate::sync::SyncError;
use crate::sync::messages::{AttachmentHint, MessageHandler, MessageSync};
use crate::sync::presence::{
	refresh_friends, send_init_presence, send_out_presence, send_sub_presence, sweep_typing, typing_started,
	user_joined, user_left,
};
use crate::xmpp::caps::{GATEWAY_FEATURES, IDENTITY, USER_FEATURES};
use crate::xmpp::{
	InIq, InMessage, InPresence, Inbound, Iq, IqPayload, IqType, Message, MessageType, NS_DISCO_INFO, OutboundError,
	Presence, PresenceType,
};

/// Period of the shared typing/friends ticker.
pub const CRON_INTERVAL: Duration = Duration::from_secs(2);
/// Stanzas buffered per account while its lane is busy.
const LANE_QUEUE: usize = 256;
/// A lane with nothing to do for this long shuts down.
const LANE_IDLE: Duration = Duration::from_secs(60);

pub const NOT_ALLOWED_NOTICE: &str = "You're not allowed to perform this action.";
pub const UNLINK_NOTICE: &str =
	"Your account was unlinked and its record deleted from the gateway. Send !link <token> to link it again.";
pub const SHUTDOWN_REASON: &str = "Shutting down by SIGINT";

/// Session registry and stanza routing for one component connection.
pub struct Gateway {
	ctx: Arc<Context>,
	transport: Arc<dyn RemoteTransport>,
	remote: RemoteSettings,
	defaults: SessionDefaults,
	sessions: RwLock<HashMap<AccountId, Arc<Session>>>,
	/// Per-account inbound queues. Each is drained by its own task.
	lanes: Mutex<HashMap<AccountId, mpsc::Sender<Inbound>>>,
	sync: MessageSync,
	bridge: Option<Arc<GroupchatBridge>>,
	alive: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
	pub fn new(
		ctx: Arc<Context>,
		transport: Arc<dyn RemoteTransport>,
		remote: RemoteSettings,
		defaults: SessionDefaults,
		conference_domain: Option<&str>,
	) -> Arc<Self> {
		let bridge = conference_domain.map(|domain| Arc::new(GroupchatBridge::new(Arc::clone(&ctx), domain)));

		let mut handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
		if let Some(bridge) = &bridge {
			handlers.push(Arc::new(GroupchatHandler::new(Arc::clone(bridge))));
		}
		handlers.push(Arc::new(AttachmentHint));
		let sync = MessageSync::new(handlers);
		debug!(handlers = ?sync.handler_names(), "message handler chain ready");

		Arc::new(Self {
			ctx,
			transport,
			remote,
			defaults,
			sessions: RwLock::new(HashMap::new()),
			lanes: Mutex::new(HashMap::new()),
			sync,
			bridge,
			alive: AtomicBool::new(true),
			tasks: Mutex::new(Vec::new()),
		})
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Acquire)
	}

	pub fn session(&self, account: &AccountId) -> Option<Arc<Session>> {
		self.sessions.read().get(account).cloned()
	}

	pub fn session_count(&self) -> usize {
		self.sessions.read().len()
	}

	fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
		self.sessions.read().values().cloned().collect()
	}

	fn update_session_gauge(&self) {
		self.ctx.stats.set_sessions_online(self.session_count());
	}

	/// Probe every stored account and start the shared ticker.
	pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
		let accounts = self.ctx.store.accounts().await?;
		self.ctx.stats.set_accounts_total(accounts.len() as u64);
		info!(accounts = accounts.len(), "probing stored accounts");
		for record in &accounts {
			self.ctx
				.send(Presence::new(self.ctx.gateway(), record.account.as_str(), PresenceType::Probe))
				.await?;
		}

		let me = Arc::clone(self);
		let cron = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(CRON_INTERVAL);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			while me.is_alive() {
				ticker.tick().await;
				me.tick(Instant::now()).await;
			}
		});
		self.tasks.lock().push(cron);
		Ok(())
	}

	/// One pass of the shared ticker over all sessions.
	pub async fn tick(&self, now: Instant) {
		for session in self.sessions_snapshot() {
			if let Err(e) = sweep_typing(&self.ctx, &session, now).await {
				warn!(account = %session.account, error = %e, "typing sweep failed");
			}
			if let Err(e) = refresh_friends(&self.ctx, &session, now, self.defaults.friends_refresh).await {
				self.on_sync_error(&session, "friends.get", e).await;
			}
		}
	}

	pub async fn notice(&self, account: &AccountId, text: impl Into<String>) -> Result<(), OutboundError> {
		self.ctx
			.send(Message::chat(self.ctx.gateway(), account.as_str(), text))
			.await
	}

	/// Validate the stored token and bring the account online.
	/// Returns `None` for unknown accounts and refused logins.
	pub async fn login(
		self: &Arc<Self>,
		account: &AccountId,
		resource: Option<&str>,
	) -> Result<Option<Arc<Session>>, SyncError> {
		if let Some(session) = self.session(account) {
			if let Some(resource) = resource {
				session.add_resource(resource);
			}
			return Ok(Some(session));
		}

		let record = match self.ctx.store.account(account).await {
			Ok(Some(record)) => record,
			Ok(None) => {
				debug!(account = %account, "presence from an account that is not linked");
				return Ok(None);
			}
			Err(e) => {
				warn!(account = %account, error = %e, "account lookup failed");
				return Ok(None);
			}
		};

		let client = RemoteClient::new(
			Arc::clone(&self.transport),
			account.as_str(),
			record.token.clone(),
			self.remote.api_version.clone(),
		)
		.with_shared_counter(Arc::clone(&self.ctx.stats.method_calls));
		let session = Arc::new(Session::new(
			account.clone(),
			Arc::new(client),
			record.cursor,
			record.roster_set,
			SessionSettings::from_defaults(&self.defaults),
		));

		match session.client.authenticate().await {
			Ok(()) => {}
			Err(ApiError::CaptchaNeeded { .. }) => {
				info!(account = %account, "captcha required during login");
			}
			Err(e @ ApiError::TokenInvalid(_)) => {
				warn!(account = %account, error = %e, "stored token rejected");
				self.unlink(account, true).await?;
				return Ok(None);
			}
			Err(e) => {
				warn!(account = %account, error = %e, "login failed");
				self.notice(account, format!("Could not connect to the remote service: {e}"))
					.await?;
				return Ok(None);
			}
		}

		if let Some(resource) = resource {
			session.add_resource(resource);
		}
		{
			let mut sessions = self.sessions.write();
			if let Some(existing) = sessions.get(account) {
				return Ok(Some(Arc::clone(existing)));
			}
			sessions.insert(account.clone(), Arc::clone(&session));
		}
		self.update_session_gauge();
		metrics::counter!("vkxmpp_logins_total").increment(1);
		info!(account = %account, "session online");

		if session.client.is_frozen() {
			self.send_captcha_challenge(&session).await?;
		} else if let Err(e) = self.initialize(&session).await {
			self.on_sync_error(&session, "messages.get", e).await;
		}
		self.spawn_worker(&session);
		Ok(Some(session))
	}

	/// Roster, presence and unread messages for a freshly authenticated session.
	pub async fn initialize(&self, session: &Session) -> Result<(), SyncError> {
		if session.client.is_frozen() {
			return Ok(());
		}
		self.refresh_display_name(session).await?;
		if let Some(friends) = session.client.friends().await? {
			if !session.roster_set() && !friends.is_empty() {
				send_sub_presence(&self.ctx, session, &friends).await?;
			}
			session.set_friends(friends);
		}
		send_init_presence(&self.ctx, session).await?;
		self.sync.sync(&self.ctx, session, true, None).await?;
		Ok(())
	}

	/// Keep the stored display name in step with the remote profile.
	async fn refresh_display_name(&self, session: &Session) -> Result<(), SyncError> {
		let name = match session.client.own_name().await {
			Ok(Some(name)) => name,
			Ok(None) => return Ok(()),
			Err(e @ ApiError::CaptchaNeeded { .. }) => return Err(e.into()),
			Err(e) => {
				debug!(account = %session.account, error = %e, "profile lookup failed");
				return Ok(());
			}
		};
		if let Err(e) = self.ctx.store.update_display_name(&session.account, &name).await {
			warn!(account = %session.account, error = %e, "failed to store display name");
		}
		Ok(())
	}

	fn spawn_worker(self: &Arc<Self>, session: &Arc<Session>) {
		let handle = tokio::spawn(worker::run(Arc::clone(self), Arc::clone(session)));
		let mut tasks = self.tasks.lock();
		tasks.retain(|t| !t.is_finished());
		tasks.push(handle);
	}

	/// Take the session offline after its owner's last resource left.
	pub async fn logout(&self, account: &AccountId, reason: Option<&str>) -> Result<(), OutboundError> {
		let Some(session) = self.sessions.write().remove(account) else {
			return Ok(());
		};
		session.stop();
		self.update_session_gauge();
		info!(account = %account, "session offline");
		send_out_presence(&self.ctx, &session, reason, false).await
	}

	/// Delete the account record and stop its session. Returns whether a record existed.
	pub async fn unlink(&self, account: &AccountId, notify: bool) -> Result<bool, OutboundError> {
		let session = self.sessions.write().remove(account);
		let deleted = match self.ctx.store.delete_account(account).await {
			Ok(deleted) => deleted,
			Err(e) => {
				warn!(account = %account, error = %e, "failed to delete account record");
				false
			}
		};
		if let Ok(total) = self.ctx.store.count().await {
			self.ctx.stats.set_accounts_total(total);
		}
		self.update_session_gauge();
		info!(account = %account, deleted, "account unlinked");

		if notify {
			self.notice(account, UNLINK_NOTICE).await?;
		}
		let Some(session) = session else {
			return Ok(deleted);
		};
		session.stop();
		if session.roster_set() {
			let mut sources: Vec<String> = session.friends().keys().map(|id| self.ctx.jids.contact(*id)).collect();
			sources.push(self.ctx.gateway().to_string());
			for from in sources {
				self.ctx
					.send(Presence::new(from.clone(), account.as_str(), PresenceType::Unsubscribe))
					.await?;
				self.ctx
					.send(Presence::new(from, account.as_str(), PresenceType::Unsubscribed))
					.await?;
			}
		}
		Ok(deleted)
	}

	pub(crate) async fn send_captcha_challenge(&self, session: &Session) -> Result<(), OutboundError> {
		let Some(captcha) = session.client.captcha() else {
			return Ok(());
		};
		metrics::counter!("vkxmpp_captcha_challenges_total").increment(1);
		self.notice(
			&session.account,
			format!(
				"The remote service asks for a captcha: {}\nReply with !captcha <text> to continue.",
				captcha.image
			),
		)
		.await
	}

	pub(crate) async fn on_sync_error(&self, session: &Session, method: &str, err: SyncError) {
		match err {
			SyncError::Api(e) => self.handle_api_error(session, method, e).await,
			SyncError::Outbound(e) => warn!(account = %session.account, error = %e, "outbound write failed"),
		}
	}

	/// Apply the error policy for a failed remote call made on behalf of `session`.
	pub async fn handle_api_error(&self, session: &Session, method: &str, err: ApiError) {
		let policy = err.policy(method);
		debug!(account = %session.account, method, error = %err, ?policy, "applying error policy");
		let result = match policy {
			ErrorPolicy::Freeze => self.send_captcha_challenge(session).await,
			ErrorPolicy::Unlink => self.unlink(&session.account, true).await.map(|_| ()),
			ErrorPolicy::NotifySender => self.notice(&session.account, NOT_ALLOWED_NOTICE).await,
			ErrorPolicy::Retry => Ok(()),
			ErrorPolicy::MarkOffline => {
				warn!(account = %session.account, method, error = %err, "remote call failed, marking offline");
				session.client.set_online_flag(false);
				Ok(())
			}
		};
		if let Err(e) = result {
			warn!(account = %session.account, error = %e, "failed to apply error policy");
		}
	}

	/// Hand an inbound stanza off without waiting on remote calls.
	/// Stanzas of one account are handled in arrival order on that account's lane;
	/// iqs and room presences are answered inline.
	pub async fn dispatch(self: &Arc<Self>, inbound: Inbound) {
		let Some(account) = self.lane_key(&inbound).await else {
			self.handle_inbound(inbound).await;
			return;
		};
		let mut inbound = inbound;
		// a lane may shut down between lookup and send; the retry opens a fresh one
		for _ in 0..2 {
			match self.lane(&account).send(inbound).await {
				Ok(()) => return,
				Err(mpsc::error::SendError(back)) => inbound = back,
			}
		}
		warn!(account = %account, "inbound lane unavailable, stanza dropped");
	}

	async fn lane_key(&self, inbound: &Inbound) -> Option<AccountId> {
		match inbound {
			Inbound::Iq(_) => None,
			Inbound::Presence(p) => {
				if self.bridge.as_ref().is_some_and(|b| b.is_room_jid(&p.from)) {
					return None;
				}
				AccountId::new(&p.from).ok()
			}
			Inbound::Message(m) => match &self.bridge {
				Some(bridge) if bridge.is_room_jid(&m.from) => {
					let room = RoomJid::new(&m.from).ok()?;
					bridge.room_account(&room).await
				}
				_ => AccountId::new(&m.from).ok(),
			},
		}
	}

	fn lane(self: &Arc<Self>, account: &AccountId) -> mpsc::Sender<Inbound> {
		let mut lanes = self.lanes.lock();
		if let Some(tx) = lanes.get(account)
			&& !tx.is_closed()
		{
			return tx.clone();
		}
		let (tx, rx) = mpsc::channel(LANE_QUEUE);
		lanes.insert(account.clone(), tx.clone());
		drop(lanes);

		let handle = tokio::spawn(Arc::clone(self).run_lane(account.clone(), tx.clone(), rx));
		let mut tasks = self.tasks.lock();
		tasks.retain(|t| !t.is_finished());
		tasks.push(handle);
		tx
	}

	async fn run_lane(self: Arc<Self>, account: AccountId, tx: mpsc::Sender<Inbound>, mut rx: mpsc::Receiver<Inbound>) {
		debug!(account = %account, "inbound lane opened");
		loop {
			match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
				Ok(Some(inbound)) => self.handle_inbound(inbound).await,
				Ok(None) => break,
				Err(_) => {
					let mut lanes = self.lanes.lock();
					if !rx.is_empty() {
						continue;
					}
					if lanes.get(&account).is_some_and(|t| t.same_channel(&tx)) {
						lanes.remove(&account);
					}
					break;
				}
			}
		}
		debug!(account = %account, "inbound lane closed");
	}

	/// Route one inbound stanza and wait for it to be fully handled.
	pub async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
		let result = match inbound {
			Inbound::Presence(p) => self.handle_presence(p).await,
			Inbound::Message(m) => self.handle_message(m).await,
			Inbound::Iq(iq) => self.handle_iq(iq).await.map_err(SyncError::from),
		};
		if let Err(e) = result {
			warn!(error = %e, "failed to handle inbound stanza");
		}
	}

	async fn handle_presence(self: &Arc<Self>, p: InPresence) -> Result<(), SyncError> {
		if let Some(bridge) = &self.bridge
			&& bridge.is_room_jid(&p.from)
		{
			if let Flow::Stop(reason) = bridge.handle_presence(&p).await? {
				debug!(from = %p.from, reason = %reason, "room presence handled");
			}
			return Ok(());
		}
		if !self.ctx.jids.is_local(&p.to) {
			return Ok(());
		}
		let Ok(account) = AccountId::new(&p.from) else {
			return Ok(());
		};
		let resource = split_jid(&p.from).1;

		match p.kind {
			PresenceType::Available => {
				let known = self.session(&account);
				match (known, resource) {
					(Some(session), Some(resource)) => {
						if session.add_resource(resource) && self.ctx.jids.is_gateway(&p.to) {
							send_init_presence(&self.ctx, &session).await?;
						}
					}
					(Some(_), None) => {}
					(None, resource) => {
						self.login(&account, resource).await?;
					}
				}
			}
			PresenceType::Probe => match self.session(&account) {
				Some(session) => send_init_presence(&self.ctx, &session).await?,
				None => {
					self.login(&account, None).await?;
				}
			},
			PresenceType::Unavailable => {
				if let Some(session) = self.session(&account)
					&& session.remove_resource(resource.unwrap_or_default())
				{
					self.logout(&account, None).await?;
				}
			}
			PresenceType::Subscribe => {
				let to = split_jid(&p.to).0;
				self.ctx
					.send(Presence::new(to, account.as_str(), PresenceType::Subscribed))
					.await?;
				if self.ctx.jids.is_gateway(to)
					&& let Some(session) = self.session(&account)
					&& !session.roster_set()
				{
					send_sub_presence(&self.ctx, &session, &session.friends()).await?;
				}
			}
			kind => debug!(account = %account, ?kind, "ignoring presence"),
		}
		Ok(())
	}

	async fn handle_message(self: &Arc<Self>, m: InMessage) -> Result<(), SyncError> {
		if m.kind == MessageType::Error {
			debug!(from = %m.from, "ignoring error message");
			return Ok(());
		}
		if let Some(bridge) = &self.bridge
			&& bridge.is_room_jid(&m.from)
		{
			let Ok(room) = RoomJid::new(&m.from) else {
				return Ok(());
			};
			let Some(session) = bridge.room_account(&room).await.and_then(|a| self.session(&a)) else {
				return Ok(());
			};
			match bridge.handle_message(&session, &m).await {
				Ok(_) => {}
				Err(SyncError::Api(e)) => self.handle_api_error(&session, "messages.send", e).await,
				Err(e) => return Err(e),
			}
			return Ok(());
		}

		let Ok(account) = AccountId::new(&m.from) else {
			return Ok(());
		};
		let Some(body) = m.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) else {
			return Ok(());
		};

		if self.ctx.jids.is_gateway(&m.to) {
			let command = commands::Command::parse(body);
			return commands::execute(self, &account, command).await;
		}

		let Some(id) = self.ctx.jids.remote_id(&m.to) else {
			return Ok(());
		};
		let Some(session) = self.session(&account) else {
			debug!(account = %account, "message from an offline account");
			return Ok(());
		};
		match session.client.send_message(Peer::User(id), body).await {
			Ok(Some(_)) => self.ctx.stats.outgoing(),
			Ok(None) => debug!(account = %account, "message not sent: client frozen or offline"),
			Err(e) if e.policy("messages.send") == ErrorPolicy::NotifySender => {
				self.ctx
					.send(Message::chat(split_jid(&m.to).0, account.as_str(), NOT_ALLOWED_NOTICE))
					.await?;
			}
			Err(e) => self.handle_api_error(&session, "messages.send", e).await,
		}
		Ok(())
	}

	async fn handle_iq(&self, iq: InIq) -> Result<(), OutboundError> {
		let payload = match (iq.kind, iq.query_ns.as_deref()) {
			(IqType::Result | IqType::Error, _) => {
				debug!(from = %iq.from, id = %iq.id, kind = ?iq.kind, "iq response");
				return Ok(());
			}
			(IqType::Get, Some(NS_DISCO_INFO)) => {
				let features = if self.ctx.jids.is_gateway(&iq.to) {
					GATEWAY_FEATURES
				} else {
					USER_FEATURES
				};
				IqPayload::DiscoInfo {
					identity: IDENTITY,
					features: features.to_vec(),
				}
			}
			_ => IqPayload::Error {
				condition: "service-unavailable",
			},
		};
		let kind = match payload {
			IqPayload::Error { .. } => IqType::Error,
			_ => IqType::Result,
		};
		self.ctx
			.send(Iq {
				from: iq.to,
				to: iq.from,
				id: iq.id,
				kind,
				payload,
			})
			.await
	}

	/// Route long-poll events for one session.
	pub(crate) async fn dispatch_events(&self, session: &Session, events: Vec<PollEvent>) {
		let now = Instant::now();
		let mut plain = Vec::new();
		let mut pull = false;
		for event in events {
			let sent = match &event {
				PollEvent::NewMessage { .. } => {
					match event.as_plain_message() {
						Some(message) => plain.push(message),
						None if event.is_outgoing() => {}
						None => pull = true,
					}
					Ok(())
				}
				PollEvent::TypingStarted(id) => typing_started(&self.ctx, session, *id, now).await,
				PollEvent::UserJoined(id) => user_joined(&self.ctx, session, *id).await,
				PollEvent::UserLeft(id) => user_left(&self.ctx, session, *id).await,
				PollEvent::Other(tag) => {
					debug!(account = %session.account, tag, "ignoring long-poll event");
					Ok(())
				}
			};
			if let Err(e) = sent {
				warn!(account = %session.account, error = %e, "failed to forward long-poll event");
			}
		}

		let batch = if pull {
			None
		} else if plain.is_empty() {
			return;
		} else {
			Some(plain)
		};
		if let Err(e) = self.sync.sync(&self.ctx, session, false, batch).await {
			self.on_sync_error(session, "messages.get", e).await;
		}
	}

	/// Graceful stop: unavailable presence from every friend, forced `setOffline`.
	pub async fn shutdown(&self, reason: &str) {
		self.alive.store(false, Ordering::Release);
		let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
		info!(sessions = sessions.len(), reason, "shutting down gateway");
		for session in &sessions {
			session.stop();
			if let Err(e) = send_out_presence(&self.ctx, session, Some(reason), true).await {
				warn!(account = %session.account, error = %e, "failed to send unavailable presence");
			}
			if let Err(e) = session.client.set_offline().await {
				warn!(account = %session.account, error = %e, "failed to mark account offline");
			}
		}
		self.abort_tasks();
	}

	/// The component connection is gone; stop workers without writing anything.
	pub fn disconnect(&self) {
		self.alive.store(false, Ordering::Release);
		let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
		warn!(sessions = sessions.len(), "component connection lost, stopping sessions");
		for session in &sessions {
			session.stop();
		}
		self.abort_tasks();
	}

	fn abort_tasks(&self) {
		self.lanes.lock().clear();
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
		self.update_session_gauge();
	}
}
