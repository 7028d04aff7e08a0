#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters exposed on `/stats`.
#[derive(Debug, Default)]
pub struct Stats {
	pub msg_in: AtomicU64,
	pub msg_out: AtomicU64,
	/// Shared with every `RemoteClient`.
	pub method_calls: Arc<AtomicU64>,
	pub sessions_online: AtomicU64,
	pub accounts_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
	pub msg_in: u64,
	pub msg_out: u64,
	pub method_calls: u64,
	pub sessions_online: u64,
	pub accounts_total: u64,
}

impl Stats {
	pub fn incoming(&self) {
		self.msg_in.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("vkxmpp_messages_in_total").increment(1);
	}

	pub fn outgoing(&self) {
		self.msg_out.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("vkxmpp_messages_out_total").increment(1);
	}

	pub fn set_sessions_online(&self, n: usize) {
		self.sessions_online.store(n as u64, Ordering::Relaxed);
		metrics::gauge!("vkxmpp_sessions_online").set(n as f64);
	}

	pub fn set_accounts_total(&self, n: u64) {
		self.accounts_total.store(n, Ordering::Relaxed);
		metrics::gauge!("vkxmpp_accounts_total").set(n as f64);
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			msg_in: self.msg_in.load(Ordering::Relaxed),
			msg_out: self.msg_out.load(Ordering::Relaxed),
			method_calls: self.method_calls.load(Ordering::Relaxed),
			sessions_online: self.sessions_online.load(Ordering::Relaxed),
			accounts_total: self.accounts_total.load(Ordering::Relaxed),
		}
	}
}
