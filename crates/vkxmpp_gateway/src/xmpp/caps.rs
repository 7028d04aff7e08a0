#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use super::{Identity, NS_CAPS, NS_CHATSTATES, NS_DELAY, NS_DISCO_INFO, NS_MUC, NS_NICK};

pub const CAPS_NODE: &str = "https://github.com/vkxmpp/vkxmpp";

pub const IDENTITY: Identity = Identity {
	category: "gateway",
	kind: "vk",
	name: "VK4XMPP Transport",
};

/// Advertised by the gateway JID.
pub const GATEWAY_FEATURES: &[&str] = &[NS_DISCO_INFO, NS_CAPS, NS_NICK, NS_MUC, NS_CHATSTATES, NS_DELAY];

/// Advertised by contact JIDs.
pub const USER_FEATURES: &[&str] = &[NS_CHATSTATES, NS_NICK, NS_DELAY];

/// XEP-0115 verification string for a single identity.
pub fn caps_hash(identity: &Identity, features: &[&str]) -> String {
	let mut sorted: Vec<&str> = features.to_vec();
	sorted.sort_unstable();
	sorted.dedup();

	let mut s = format!("{}/{}//{}<", identity.category, identity.kind, identity.name);
	for f in sorted {
		s.push_str(f);
		s.push('<');
	}
	STANDARD.encode(Sha1::digest(s.as_bytes()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_ignores_feature_order() {
		let a = caps_hash(&IDENTITY, &["b", "a", "c"]);
		let b = caps_hash(&IDENTITY, &["c", "b", "a"]);
		assert_eq!(a, b);
		assert_ne!(a, caps_hash(&IDENTITY, &["a", "b"]));
	}

	#[test]
	fn matches_xep_0115_example() {
		let identity = Identity {
			category: "client",
			kind: "pc",
			name: "Exodus 0.9.1",
		};
		let features = [
			"http://jabber.org/protocol/caps",
			"http://jabber.org/protocol/disco#info",
			"http://jabber.org/protocol/disco#items",
			"http://jabber.org/protocol/muc",
		];
		assert_eq!(caps_hash(&identity, &features), "QgayPKawpkPSDYmwT/WM94uAlu0=");
	}
}
