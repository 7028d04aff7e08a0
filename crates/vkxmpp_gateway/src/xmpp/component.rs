#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use minidom::Element;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::framer::{Frame, Framer};
use super::stanza::{parse, render};
use super::{Inbound, NS_COMPONENT, NS_STREAM, OutboundError, OutboundSink, Stanza};
use crate::config::ComponentSettings;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_QUEUE: usize = 1024;
const INBOUND_QUEUE: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;

/// `hex(sha1(stream_id + secret))` per XEP-0114.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(stream_id.as_bytes());
	hasher.update(secret.as_bytes());
	hex::encode(hasher.finalize())
}

/// Write side of the component stream. All writes are serialized by one task.
#[derive(Debug)]
pub struct ComponentSink {
	tx: mpsc::Sender<String>,
	closed: Arc<watch::Sender<bool>>,
}

impl ComponentSink {
	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	/// Resolve once either direction of the stream has failed or been closed.
	pub async fn wait_closed(&self) {
		closed_signal(&mut self.closed.subscribe()).await;
	}

	/// Send the closing stream tag and stop the writer.
	pub async fn close(&self) {
		if self.tx.send("</stream:stream>".to_string()).await.is_err() {
			debug!("component: writer already gone");
		}
		self.closed.send_replace(true);
	}
}

#[async_trait::async_trait]
impl OutboundSink for ComponentSink {
	async fn send(&self, stanza: Stanza) -> Result<(), OutboundError> {
		if self.is_closed() {
			return Err(OutboundError::Closed);
		}
		let xml = String::from(&render(&stanza));
		self.tx.send(xml).await.map_err(|_| OutboundError::Closed)?;
		metrics::counter!("vkxmpp_stanzas_out_total").increment(1);
		Ok(())
	}
}

pub struct ComponentConnection {
	pub sink: Arc<ComponentSink>,
	pub inbound: mpsc::Receiver<Inbound>,
}

/// Connect, authenticate and start the reader/writer tasks.
pub async fn connect(settings: &ComponentSettings) -> anyhow::Result<ComponentConnection> {
	let addr = format!("{}:{}", settings.host, settings.port);
	let stream = TcpStream::connect(&addr)
		.await
		.with_context(|| format!("connect component socket {addr}"))?;
	let (mut reader, mut writer) = stream.into_split();
	let mut framer = Framer::default();

	tokio::time::timeout(
		HANDSHAKE_TIMEOUT,
		handshake(&mut reader, &mut writer, &mut framer, settings),
	)
	.await
	.map_err(|_| anyhow!("component handshake timed out"))??;
	info!(jid = %settings.jid, %addr, "component: authenticated");

	let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
	let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
	let closed = Arc::new(watch::channel(false).0);

	tokio::spawn(write_loop(writer, out_rx, Arc::clone(&closed)));
	tokio::spawn(read_loop(reader, framer, in_tx, Arc::clone(&closed)));

	Ok(ComponentConnection {
		sink: Arc::new(ComponentSink { tx: out_tx, closed }),
		inbound: in_rx,
	})
}

async fn handshake(
	reader: &mut OwnedReadHalf,
	writer: &mut OwnedWriteHalf,
	framer: &mut Framer,
	settings: &ComponentSettings,
) -> anyhow::Result<()> {
	let header = format!(
		"<?xml version='1.0'?><stream:stream xmlns='{NS_COMPONENT}' xmlns:stream='{NS_STREAM}' to='{}'>",
		settings.jid
	);
	writer.write_all(header.as_bytes()).await.context("write stream header")?;

	let stream_id = match next_frame(reader, framer).await? {
		Frame::StreamOpen { id: Some(id) } => id,
		Frame::StreamOpen { id: None } => bail!("stream header carries no id"),
		other => bail!("expected stream header, got {other:?}"),
	};

	let digest = handshake_digest(&stream_id, settings.secret.expose());
	writer
		.write_all(format!("<handshake>{digest}</handshake>").as_bytes())
		.await
		.context("write handshake")?;

	match next_frame(reader, framer).await? {
		Frame::Stanza(xml) => {
			let el: Element = xml.parse().context("parse handshake reply")?;
			if el.name() == "handshake" {
				Ok(())
			} else if el.is("error", NS_STREAM) {
				let condition = el.children().next().map(|c| c.name().to_string()).unwrap_or_default();
				bail!("component authentication rejected: {condition}")
			} else {
				bail!("unexpected handshake reply <{}>", el.name())
			}
		}
		Frame::StreamClose => bail!("server closed the stream during handshake"),
		Frame::StreamOpen { .. } => bail!("duplicate stream header"),
	}
}

async fn next_frame<R: AsyncRead + Unpin>(reader: &mut R, framer: &mut Framer) -> anyhow::Result<Frame> {
	let mut buf = vec![0u8; READ_CHUNK];
	loop {
		if let Some(frame) = framer.next_frame()? {
			return Ok(frame);
		}
		let n = reader.read(&mut buf).await.context("read component socket")?;
		if n == 0 {
			bail!("component socket closed");
		}
		framer.push(&buf[..n]);
	}
}

/// Resolves once the close flag is set. The borrow guard from `wait_for` is
/// released before returning.
async fn closed_signal(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>, closed: Arc<watch::Sender<bool>>) {
	let mut closed_rx = closed.subscribe();
	loop {
		tokio::select! {
			chunk = rx.recv() => {
				let Some(chunk) = chunk else { break };
				if let Err(e) = writer.write_all(chunk.as_bytes()).await {
					warn!(error = %e, "component: write failed");
					metrics::counter!("vkxmpp_component_write_errors_total").increment(1);
					break;
				}
			}
			() = closed_signal(&mut closed_rx) => {
				// flush whatever was queued before the close
				while let Ok(chunk) = rx.try_recv() {
					if writer.write_all(chunk.as_bytes()).await.is_err() {
						break;
					}
				}
				break;
			}
		}
	}
	let _ = writer.shutdown().await;
	closed.send_replace(true);
}

async fn read_loop(
	mut reader: OwnedReadHalf,
	mut framer: Framer,
	tx: mpsc::Sender<Inbound>,
	closed: Arc<watch::Sender<bool>>,
) {
	let mut closed_rx = closed.subscribe();
	let mut buf = vec![0u8; READ_CHUNK];
	'outer: loop {
		// the handshake may have left stanzas in the framer
		loop {
			let frame = match framer.next_frame() {
				Ok(Some(frame)) => frame,
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "component: stream framing failed");
					break 'outer;
				}
			};
			let xml = match frame {
				Frame::Stanza(xml) => xml,
				Frame::StreamClose => {
					info!("component: server closed the stream");
					break 'outer;
				}
				Frame::StreamOpen { .. } => continue,
			};
			metrics::counter!("vkxmpp_stanzas_in_total").increment(1);

			let el: Element = match xml.parse() {
				Ok(el) => el,
				Err(e) => {
					warn!(error = %e, "component: unparsable stanza dropped");
					continue;
				}
			};
			if el.is("error", NS_STREAM) {
				let condition = el.children().next().map(|c| c.name().to_string()).unwrap_or_default();
				warn!(%condition, "component: stream error");
				break 'outer;
			}
			match parse(&el) {
				Ok(inbound) => {
					if tx.send(inbound).await.is_err() {
						break 'outer;
					}
				}
				Err(e) => debug!(error = %e, "component: stanza ignored"),
			}
		}

		let n = tokio::select! {
			res = reader.read(&mut buf) => match res {
				Ok(0) => {
					info!("component: server closed the socket");
					break;
				}
				Ok(n) => n,
				Err(e) => {
					warn!(error = %e, "component: read failed");
					break;
				}
			},
			() = closed_signal(&mut closed_rx) => break,
		};
		framer.push(&buf[..n]);
	}
	closed.send_replace(true);
}
