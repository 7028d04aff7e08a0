#![forbid(unsafe_code)]

use minidom::Element;
use thiserror::Error;

use super::caps::CAPS_NODE;
use super::{
	InIq, InMessage, InPresence, Inbound, Iq, IqPayload, IqType, Message, MessageType, MucItem, NS_CAPS,
	NS_CHATSTATES, NS_COMPONENT, NS_DATA_FORMS, NS_DELAY, NS_DISCO_INFO, NS_MUC, NS_MUC_ADMIN, NS_MUC_OWNER,
	NS_MUC_USER, NS_NICK, NS_STANZAS, Presence, PresenceType, Stanza, StanzaError,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StanzaParseError {
	#[error("unsupported element <{0}>")]
	Unsupported(String),
	#[error("missing attribute {0}")]
	MissingAttr(&'static str),
	#[error("unknown {kind} type {value:?}")]
	BadType { kind: &'static str, value: String },
}

fn text_child(name: &str, text: &str) -> Element {
	Element::builder(name, NS_COMPONENT).append(text.to_string()).build()
}

fn delay_stamp(ts: i64) -> Option<String> {
	chrono::DateTime::from_timestamp(ts, 0).map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

pub fn render(stanza: &Stanza) -> Element {
	match stanza {
		Stanza::Presence(p) => render_presence(p),
		Stanza::Message(m) => render_message(m),
		Stanza::Iq(iq) => render_iq(iq),
	}
}

fn render_presence(p: &Presence) -> Element {
	let mut b = Element::builder("presence", NS_COMPONENT)
		.attr("from", p.from.as_str())
		.attr("to", p.to.as_str());
	if let Some(kind) = p.kind.as_attr() {
		b = b.attr("type", kind);
	}
	if let Some(status) = &p.status {
		b = b.append(text_child("status", status));
	}
	if let Some(nick) = &p.nick {
		b = b.append(Element::builder("nick", NS_NICK).append(nick.clone()).build());
	}
	if let Some(ver) = &p.caps {
		b = b.append(
			Element::builder("c", NS_CAPS)
				.attr("hash", "sha-1")
				.attr("node", CAPS_NODE)
				.attr("ver", ver.as_str())
				.build(),
		);
	}
	if p.muc_join {
		b = b.append(Element::builder("x", NS_MUC).build());
	}
	b.build()
}

fn render_message(m: &Message) -> Element {
	let mut b = Element::builder("message", NS_COMPONENT)
		.attr("from", m.from.as_str())
		.attr("to", m.to.as_str())
		.attr("type", m.kind.as_attr());
	if let Some(body) = &m.body {
		b = b.append(text_child("body", body));
	}
	if let Some(state) = m.chat_state {
		b = b.append(Element::builder(state.as_str(), NS_CHATSTATES).build());
	}
	if let Some(stamp) = m.timestamp.and_then(delay_stamp) {
		b = b.append(
			Element::builder("delay", NS_DELAY)
				.attr("from", m.from.as_str())
				.attr("stamp", stamp)
				.build(),
		);
	}
	b.build()
}

fn render_iq(iq: &Iq) -> Element {
	let b = Element::builder("iq", NS_COMPONENT)
		.attr("from", iq.from.as_str())
		.attr("to", iq.to.as_str())
		.attr("id", iq.id.as_str())
		.attr("type", iq.kind.as_attr());

	match &iq.payload {
		IqPayload::Empty => b.build(),
		IqPayload::DiscoInfo { identity, features } => {
			let mut q = Element::builder("query", NS_DISCO_INFO).append(
				Element::builder("identity", NS_DISCO_INFO)
					.attr("category", identity.category)
					.attr("type", identity.kind)
					.attr("name", identity.name)
					.build(),
			);
			for f in features {
				q = q.append(Element::builder("feature", NS_DISCO_INFO).attr("var", *f).build());
			}
			b.append(q.build()).build()
		}
		IqPayload::Affiliation {
			jid,
			affiliation,
			reason,
		} => {
			let mut item = Element::builder("item", NS_MUC_ADMIN)
				.attr("affiliation", affiliation.as_str())
				.attr("jid", jid.as_str());
			if let Some(reason) = reason {
				item = item.append(Element::builder("reason", NS_MUC_ADMIN).append(reason.clone()).build());
			}
			b.append(Element::builder("query", NS_MUC_ADMIN).append(item.build()).build())
				.build()
		}
		IqPayload::InstantRoom => b
			.append(
				Element::builder("query", NS_MUC_OWNER)
					.append(Element::builder("x", NS_DATA_FORMS).attr("type", "submit").build())
					.build(),
			)
			.build(),
		IqPayload::Destroy { reason } => {
			let mut destroy = Element::builder("destroy", NS_MUC_OWNER);
			if let Some(reason) = reason {
				destroy = destroy.append(Element::builder("reason", NS_MUC_OWNER).append(reason.clone()).build());
			}
			b.append(Element::builder("query", NS_MUC_OWNER).append(destroy.build()).build())
				.build()
		}
		IqPayload::Error { condition } => b
			.append(
				Element::builder("error", NS_COMPONENT)
					.attr("type", "cancel")
					.append(Element::builder(*condition, NS_STANZAS).build())
					.build(),
			)
			.build(),
	}
}

/// First child with this local name, regardless of namespace.
fn child<'a>(el: &'a Element, name: &str) -> Option<&'a Element> {
	el.children().find(|c| c.name() == name)
}

fn required_attr(el: &Element, name: &'static str) -> Result<String, StanzaParseError> {
	el.attr(name)
		.map(str::to_string)
		.ok_or(StanzaParseError::MissingAttr(name))
}

pub fn parse(el: &Element) -> Result<Inbound, StanzaParseError> {
	match el.name() {
		"presence" => parse_presence(el).map(Inbound::Presence),
		"message" => parse_message(el).map(Inbound::Message),
		"iq" => parse_iq(el).map(Inbound::Iq),
		other => Err(StanzaParseError::Unsupported(other.to_string())),
	}
}

fn parse_presence(el: &Element) -> Result<InPresence, StanzaParseError> {
	let kind = PresenceType::from_attr(el.attr("type")).ok_or_else(|| StanzaParseError::BadType {
		kind: "presence",
		value: el.attr("type").unwrap_or_default().to_string(),
	})?;
	let mut p = InPresence::new(required_attr(el, "from")?, el.attr("to").unwrap_or_default(), kind);
	p.status = child(el, "status").map(Element::text).filter(|s| !s.is_empty());
	p.nick = el.get_child("nick", NS_NICK).map(Element::text);

	if let Some(err) = child(el, "error") {
		p.error = Some(StanzaError {
			code: err.attr("code").map(str::to_string),
			kind: err.attr("type").map(str::to_string),
			condition: err
				.children()
				.find(|c| c.ns() == NS_STANZAS && c.name() != "text")
				.map(|c| c.name().to_string()),
		});
	}

	if let Some(x) = el.get_child("x", NS_MUC_USER) {
		let mut item = MucItem::default();
		if let Some(i) = x.get_child("item", NS_MUC_USER) {
			item.jid = i.attr("jid").map(str::to_string);
			item.role = i.attr("role").map(str::to_string);
			item.affiliation = i.attr("affiliation").map(str::to_string);
			item.nick = i.attr("nick").map(str::to_string);
		}
		item.status_codes = x
			.children()
			.filter(|c| c.is("status", NS_MUC_USER))
			.filter_map(|c| c.attr("code").map(str::to_string))
			.collect();
		p.muc = Some(item);
	}
	Ok(p)
}

fn parse_message(el: &Element) -> Result<InMessage, StanzaParseError> {
	Ok(InMessage {
		from: required_attr(el, "from")?,
		to: el.attr("to").unwrap_or_default().to_string(),
		kind: MessageType::from_attr(el.attr("type")),
		body: child(el, "body").map(Element::text),
	})
}

fn parse_iq(el: &Element) -> Result<InIq, StanzaParseError> {
	let kind = IqType::from_attr(el.attr("type")).ok_or_else(|| StanzaParseError::BadType {
		kind: "iq",
		value: el.attr("type").unwrap_or_default().to_string(),
	})?;
	Ok(InIq {
		from: required_attr(el, "from")?,
		to: el.attr("to").unwrap_or_default().to_string(),
		id: el.attr("id").unwrap_or_default().to_string(),
		kind,
		query_ns: el.children().next().map(|c| c.ns()),
	})
}
