#![forbid(unsafe_code)]

use std::sync::Arc;

use vkxmpp_domain::JidMap;

use crate::store::AccountStore;
use crate::stats::Stats;
use crate::xmpp::caps::{GATEWAY_FEATURES, IDENTITY, USER_FEATURES, caps_hash};
use crate::xmpp::{OutboundError, OutboundSink, Stanza};

/// Shared collaborators of one component connection.
pub struct Context {
	pub jids: JidMap,
	pub sink: Arc<dyn OutboundSink>,
	pub store: Arc<dyn AccountStore>,
	pub stats: Arc<Stats>,
	pub gateway_caps: String,
	pub user_caps: String,
}

impl Context {
	pub fn new(jids: JidMap, sink: Arc<dyn OutboundSink>, store: Arc<dyn AccountStore>, stats: Arc<Stats>) -> Self {
		Self {
			jids,
			sink,
			store,
			stats,
			gateway_caps: caps_hash(&IDENTITY, GATEWAY_FEATURES),
			user_caps: caps_hash(&IDENTITY, USER_FEATURES),
		}
	}

	pub fn gateway(&self) -> &str {
		self.jids.gateway()
	}

	pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), OutboundError> {
		self.sink.send(stanza.into()).await
	}
}
