#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use url::Url;
use vkxmpp_domain::{AccountId, JidMap};
use vkxmpp_remote::{ApiError, RemoteClient, RemoteTransport, SecretString};

use crate::context::Context;
use crate::session::{Session, SessionSettings};
use crate::stats::Stats;
use crate::store::InMemoryStore;
use crate::xmpp::{Iq, Message, OutboundError, OutboundSink, Presence, PresenceType, Stanza};

pub(crate) const GATEWAY: &str = "vk.example.org";
pub(crate) const CONFERENCE: &str = "conference.example.org";

pub(crate) fn account(jid: &str) -> AccountId {
	AccountId::new(jid).unwrap()
}

/// Scripted transport. Unscripted methods answer `1`; polls without a script hang.
#[derive(Default)]
pub(crate) struct FakeTransport {
	replies: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
	polls: Mutex<VecDeque<Result<String, ApiError>>>,
	gates: Mutex<HashMap<String, Arc<Notify>>>,
	pub(crate) calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeTransport {
	pub(crate) fn reply(&self, method: &str, result: Result<Value, ApiError>) {
		self.replies.lock().entry(method.to_string()).or_default().push_back(result);
	}

	/// Calls to `method` wait until the returned gate is notified.
	pub(crate) fn hold(&self, method: &str) -> Arc<Notify> {
		let gate = Arc::new(Notify::new());
		self.gates.lock().insert(method.to_string(), Arc::clone(&gate));
		gate
	}

	pub(crate) fn push_poll(&self, body: Result<String, ApiError>) {
		self.polls.lock().push_back(body);
	}

	pub(crate) fn methods(&self) -> Vec<String> {
		self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
	}

	pub(crate) fn count(&self, method: &str) -> usize {
		self.calls.lock().iter().filter(|(m, _)| m == method).count()
	}

	/// Parameters of the most recent call to `method`.
	pub(crate) fn last_params(&self, method: &str) -> Option<Vec<(String, String)>> {
		self.calls
			.lock()
			.iter()
			.rev()
			.find(|(m, _)| m == method)
			.map(|(_, p)| p.clone())
	}
}

#[async_trait]
impl RemoteTransport for FakeTransport {
	async fn call(&self, method: &str, params: &[(String, String)]) -> Result<Value, ApiError> {
		self.calls.lock().push((method.to_string(), params.to_vec()));
		let gate = self.gates.lock().get(method).cloned();
		if let Some(gate) = gate {
			gate.notified().await;
		}
		let scripted = self.replies.lock().get_mut(method).and_then(VecDeque::pop_front);
		scripted.unwrap_or_else(|| Ok(json!(1)))
	}

	async fn poll(&self, _url: &Url, _timeout: Duration) -> Result<String, ApiError> {
		let next = self.polls.lock().pop_front();
		match next {
			Some(body) => body,
			None => {
				tokio::time::sleep(Duration::from_secs(3600)).await;
				Ok(String::new())
			}
		}
	}
}

/// Outbound sink that records every stanza.
#[derive(Default)]
pub(crate) struct RecordingSink {
	sent: Mutex<Vec<Stanza>>,
	pub(crate) fail: AtomicBool,
}

impl RecordingSink {
	pub(crate) fn take(&self) -> Vec<Stanza> {
		std::mem::take(&mut *self.sent.lock())
	}

	pub(crate) fn presences(&self) -> Vec<Presence> {
		self.sent
			.lock()
			.iter()
			.filter_map(|s| match s {
				Stanza::Presence(p) => Some(p.clone()),
				_ => None,
			})
			.collect()
	}

	pub(crate) fn presences_of(&self, kind: PresenceType) -> Vec<Presence> {
		self.presences().into_iter().filter(|p| p.kind == kind).collect()
	}

	pub(crate) fn messages(&self) -> Vec<Message> {
		self.sent
			.lock()
			.iter()
			.filter_map(|s| match s {
				Stanza::Message(m) => Some(m.clone()),
				_ => None,
			})
			.collect()
	}

	pub(crate) fn bodies(&self) -> Vec<String> {
		self.messages().into_iter().filter_map(|m| m.body).collect()
	}

	pub(crate) fn iqs(&self) -> Vec<Iq> {
		self.sent
			.lock()
			.iter()
			.filter_map(|s| match s {
				Stanza::Iq(iq) => Some(iq.clone()),
				_ => None,
			})
			.collect()
	}
}

#[async_trait]
impl OutboundSink for RecordingSink {
	async fn send(&self, stanza: Stanza) -> Result<(), OutboundError> {
		if self.fail.load(Ordering::Relaxed) {
			return Err(OutboundError::Closed);
		}
		self.sent.lock().push(stanza);
		Ok(())
	}
}

pub(crate) struct TestHarness {
	pub(crate) transport: Arc<FakeTransport>,
	pub(crate) sink: Arc<RecordingSink>,
	pub(crate) store: Arc<InMemoryStore>,
	pub(crate) stats: Arc<Stats>,
	pub(crate) ctx: Arc<Context>,
}

impl TestHarness {
	pub(crate) fn new() -> Self {
		let transport = Arc::new(FakeTransport::default());
		let sink = Arc::new(RecordingSink::default());
		let store = Arc::new(InMemoryStore::default());
		let stats = Arc::new(Stats::default());
		let ctx = Arc::new(Context::new(
			JidMap::new(GATEWAY).unwrap(),
			sink.clone(),
			store.clone(),
			Arc::clone(&stats),
		));
		Self {
			transport,
			sink,
			store,
			stats,
			ctx,
		}
	}

	pub(crate) fn remote_transport(&self) -> Arc<dyn RemoteTransport> {
		self.transport.clone()
	}

	/// A client that is already online.
	pub(crate) fn client(&self, account: &AccountId) -> Arc<RemoteClient> {
		let client = RemoteClient::new(self.remote_transport(), account.as_str(), SecretString::new("tok"), "5.81")
			.with_shared_counter(Arc::clone(&self.stats.method_calls));
		client.set_online_flag(true);
		Arc::new(client)
	}

	pub(crate) fn session(&self, account: &AccountId) -> Arc<Session> {
		Arc::new(Session::new(
			account.clone(),
			self.client(account),
			0,
			false,
			SessionSettings::default(),
		))
	}
}
