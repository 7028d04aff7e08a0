#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use vkxmpp_domain::{AccountId, RemoteId};
use vkxmpp_remote::{Friend, RemoteClient};

use crate::config::SessionDefaults;

/// Per-account toggles, changeable at runtime with `!set`.
#[derive(Debug, Default)]
pub struct SessionSettings {
	preserve_timestamps: AtomicBool,
	keep_online: AtomicBool,
}

impl SessionSettings {
	pub fn from_defaults(d: &SessionDefaults) -> Self {
		Self {
			preserve_timestamps: AtomicBool::new(d.preserve_timestamps),
			keep_online: AtomicBool::new(d.keep_online),
		}
	}

	pub fn preserve_timestamps(&self) -> bool {
		self.preserve_timestamps.load(Ordering::Relaxed)
	}

	pub fn keep_online(&self) -> bool {
		self.keep_online.load(Ordering::Relaxed)
	}

	/// Returns `false` for unknown setting names.
	pub fn set(&self, name: &str, value: bool) -> bool {
		let slot = match name {
			"preserve_timestamps" => &self.preserve_timestamps,
			"keep_online" => &self.keep_online,
			_ => return false,
		};
		slot.store(value, Ordering::Relaxed);
		true
	}

	pub fn describe(&self) -> String {
		format!(
			"preserve_timestamps={} keep_online={}",
			on_off(self.preserve_timestamps()),
			on_off(self.keep_online())
		)
	}
}

fn on_off(v: bool) -> &'static str {
	if v { "on" } else { "off" }
}

/// Runtime state of one linked account.
pub struct Session {
	pub account: AccountId,
	pub client: Arc<RemoteClient>,
	pub settings: SessionSettings,
	/// Newest delivered message id. Held for the whole of a sync batch.
	pub(crate) cursor: tokio::sync::Mutex<i64>,
	roster_set: AtomicBool,
	friends: RwLock<BTreeMap<RemoteId, Friend>>,
	typing: Mutex<HashMap<RemoteId, Instant>>,
	resources: Mutex<BTreeSet<String>>,
	last_friends_refresh: Mutex<Option<Instant>>,
	stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("account", &self.account)
			.field("stopped", &self.is_stopped())
			.finish_non_exhaustive()
	}
}

impl Session {
	pub fn new(account: AccountId, client: Arc<RemoteClient>, cursor: i64, roster_set: bool, settings: SessionSettings) -> Self {
		Self {
			account,
			client,
			settings,
			cursor: tokio::sync::Mutex::new(cursor),
			roster_set: AtomicBool::new(roster_set),
			friends: RwLock::new(BTreeMap::new()),
			typing: Mutex::new(HashMap::new()),
			resources: Mutex::new(BTreeSet::new()),
			last_friends_refresh: Mutex::new(None),
			stop: watch::channel(false).0,
		}
	}

	pub async fn cursor(&self) -> i64 {
		*self.cursor.lock().await
	}

	pub fn roster_set(&self) -> bool {
		self.roster_set.load(Ordering::Acquire)
	}

	pub fn mark_roster_set(&self) {
		self.roster_set.store(true, Ordering::Release);
	}

	pub fn friends(&self) -> BTreeMap<RemoteId, Friend> {
		self.friends.read().clone()
	}

	pub fn has_friends(&self) -> bool {
		!self.friends.read().is_empty()
	}

	pub fn friend(&self, id: RemoteId) -> Option<Friend> {
		self.friends.read().get(&id).cloned()
	}

	pub fn set_friends(&self, friends: BTreeMap<RemoteId, Friend>) {
		*self.friends.write() = friends;
	}

	/// Update the cached online flag for one friend.
	pub fn set_friend_online(&self, id: RemoteId, online: bool) {
		if let Some(f) = self.friends.write().get_mut(&id) {
			f.online = online;
		}
	}

	/// Record typing activity. Returns `true` when `id` was not typing before.
	pub fn mark_typing(&self, id: RemoteId, now: Instant) -> bool {
		self.typing.lock().insert(id, now).is_none()
	}

	pub fn is_typing(&self, id: RemoteId) -> bool {
		self.typing.lock().contains_key(&id)
	}

	/// Remove and return ids idle for longer than `timeout`.
	pub fn take_idle_typers(&self, now: Instant, timeout: Duration) -> Vec<RemoteId> {
		let mut typing = self.typing.lock();
		let idle: Vec<RemoteId> = typing
			.iter()
			.filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
			.map(|(id, _)| *id)
			.collect();
		for id in &idle {
			typing.remove(id);
		}
		idle
	}

	/// Returns `true` when the resource was not known yet.
	pub fn add_resource(&self, resource: &str) -> bool {
		self.resources.lock().insert(resource.to_string())
	}

	/// Returns `true` when no resources remain.
	pub fn remove_resource(&self, resource: &str) -> bool {
		let mut resources = self.resources.lock();
		resources.remove(resource);
		resources.is_empty()
	}

	#[cfg(test)]
	pub fn resources(&self) -> Vec<String> {
		self.resources.lock().iter().cloned().collect()
	}

	pub fn friends_refresh_due(&self, now: Instant, interval: Duration) -> bool {
		match *self.last_friends_refresh.lock() {
			None => true,
			Some(last) => now.saturating_duration_since(last) > interval,
		}
	}

	pub fn mark_friends_refreshed(&self, now: Instant) {
		*self.last_friends_refresh.lock() = Some(now);
	}

	/// Ask the poll worker to exit and release any captcha waiter.
	pub fn stop(&self) {
		self.stop.send_replace(true);
		self.client.release_waiters();
	}

	pub fn is_stopped(&self) -> bool {
		*self.stop.borrow()
	}

	pub async fn stopped(&self) {
		let mut rx = self.stop.subscribe();
		let _ = rx.wait_for(|s| *s).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{TestHarness, account};

	#[test]
	fn settings_toggle_known_names_only() {
		let s = SessionSettings::default();
		assert!(s.set("keep_online", true));
		assert!(s.keep_online());
		assert!(!s.set("volume", true));
		assert_eq!(s.describe(), "preserve_timestamps=off keep_online=on");
	}

	#[tokio::test]
	async fn typing_first_occurrence_and_expiry() {
		let h = TestHarness::new();
		let session = h.session(&account("alice@example.org"));
		let t0 = Instant::now();
		assert!(session.mark_typing(RemoteId(7), t0));
		assert!(!session.mark_typing(RemoteId(7), t0 + Duration::from_secs(1)));
		assert!(session.take_idle_typers(t0 + Duration::from_secs(7), Duration::from_secs(7)).is_empty());
		assert_eq!(
			session.take_idle_typers(t0 + Duration::from_secs(9), Duration::from_secs(7)),
			vec![RemoteId(7)]
		);
		assert!(!session.is_typing(RemoteId(7)));
	}

	#[tokio::test]
	async fn resources_and_stop() {
		let h = TestHarness::new();
		let session = h.session(&account("alice@example.org"));
		assert!(session.add_resource("pc"));
		assert!(!session.add_resource("pc"));
		session.add_resource("phone");
		assert!(!session.remove_resource("pc"));
		assert!(session.remove_resource("phone"));

		assert!(!session.is_stopped());
		session.stop();
		tokio::time::timeout(Duration::from_millis(200), session.stopped()).await.unwrap();
	}
}
