#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::{NS_COMPONENT, NS_STREAM};

/// Largest top-level stanza accepted from the server.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramerError {
	#[error("stanza exceeds maximum size: len={len} max={max}")]
	TooLarge { len: usize, max: usize },
	#[error("unexpected data before stream header: {0}")]
	UnexpectedHeader(String),
	#[error("unbalanced closing tag")]
	Unbalanced,
	#[error("stanza is not valid utf-8")]
	Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	StreamOpen { id: Option<String> },
	/// One complete top-level element, namespaced so it parses standalone.
	Stanza(String),
	StreamClose,
}

/// Splits the component stream into top-level stanzas.
#[derive(Debug)]
pub struct Framer {
	buf: BytesMut,
	in_stream: bool,
	max_size: usize,
}

impl Default for Framer {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_STANZA_SIZE)
	}
}

impl Framer {
	pub fn new(max_size: usize) -> Self {
		Self {
			buf: BytesMut::new(),
			in_stream: false,
			max_size,
		}
	}

	pub fn push(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	pub fn next_frame(&mut self) -> Result<Option<Frame>, FramerError> {
		loop {
			let Some(start) = self.buf.iter().position(|&b| b == b'<') else {
				self.buf.clear();
				return Ok(None);
			};
			self.buf.advance(start);

			if let Some(skip) = skip_markup(&self.buf) {
				match skip {
					Some(end) => {
						self.buf.advance(end);
						continue;
					}
					None => return self.incomplete(),
				}
			}

			if self.buf.starts_with(b"</stream:stream") {
				let Some(end) = tag_end(&self.buf, 0) else {
					return self.incomplete();
				};
				self.buf.advance(end + 1);
				self.in_stream = false;
				return Ok(Some(Frame::StreamClose));
			}

			if !self.in_stream {
				let Some(end) = tag_end(&self.buf, 0) else {
					return self.incomplete();
				};
				let tag = std::str::from_utf8(&self.buf[..=end]).map_err(|_| FramerError::Utf8)?;
				if !tag.starts_with("<stream:stream") {
					return Err(FramerError::UnexpectedHeader(tag.chars().take(64).collect()));
				}
				let id = attr_value(tag, "id");
				self.buf.advance(end + 1);
				self.in_stream = true;
				return Ok(Some(Frame::StreamOpen { id }));
			}

			return match scan_element(&self.buf)? {
				Some(end) => {
					let raw = self.buf.split_to(end);
					let raw = String::from_utf8(raw.to_vec()).map_err(|_| FramerError::Utf8)?;
					Ok(Some(Frame::Stanza(with_namespaces(&raw))))
				}
				None => self.incomplete(),
			};
		}
	}

	fn incomplete(&self) -> Result<Option<Frame>, FramerError> {
		if self.buf.len() > self.max_size {
			return Err(FramerError::TooLarge {
				len: self.buf.len(),
				max: self.max_size,
			});
		}
		Ok(None)
	}
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
	haystack
		.get(from..)?
		.windows(needle.len())
		.position(|w| w == needle)
		.map(|p| p + from)
}

/// `Some(Some(end))` for a complete declaration/comment/CDATA block at the start of `buf`,
/// `Some(None)` when it is still incomplete, `None` for a regular tag.
fn skip_markup(buf: &[u8]) -> Option<Option<usize>> {
	let terminator: &[u8] = if buf.starts_with(b"<?") {
		b"?>"
	} else if buf.starts_with(b"<!--") {
		b"-->"
	} else if buf.starts_with(b"<![CDATA[") {
		b"]]>"
	} else if buf.starts_with(b"<!") {
		b">"
	} else {
		return None;
	};
	Some(find(buf, 2, terminator).map(|p| p + terminator.len()))
}

/// Index of the `>` closing the tag opened at `start`, honoring quoted attribute values.
fn tag_end(buf: &[u8], start: usize) -> Option<usize> {
	let mut quote: Option<u8> = None;
	for (i, &b) in buf.iter().enumerate().skip(start + 1) {
		match (quote, b) {
			(Some(q), b) if b == q => quote = None,
			(Some(_), _) => {}
			(None, b'"' | b'\'') => quote = Some(b),
			(None, b'>') => return Some(i),
			(None, _) => {}
		}
	}
	None
}

/// Length of the complete element starting at `buf[0]`, if all of it has arrived.
fn scan_element(buf: &[u8]) -> Result<Option<usize>, FramerError> {
	let mut depth: usize = 0;
	let mut i = 0;
	while i < buf.len() {
		if buf[i] != b'<' {
			i += 1;
			continue;
		}
		if let Some(skip) = skip_markup(&buf[i..]) {
			match skip {
				Some(len) => {
					i += len;
					continue;
				}
				None => return Ok(None),
			}
		}
		let Some(end) = tag_end(buf, i) else {
			return Ok(None);
		};
		if buf.get(i + 1) == Some(&b'/') {
			depth = depth.checked_sub(1).ok_or(FramerError::Unbalanced)?;
		} else if buf[end - 1] != b'/' {
			depth += 1;
		}
		i = end + 1;
		if depth == 0 {
			return Ok(Some(i));
		}
	}
	Ok(None)
}

fn attr_value(tag: &str, name: &str) -> Option<String> {
	let pattern = format!("{name}=");
	let mut from = 0;
	while let Some(pos) = tag[from..].find(&pattern) {
		let at = from + pos;
		from = at + pattern.len();
		if !tag[..at].ends_with(char::is_whitespace) {
			continue;
		}
		let rest = &tag[from..];
		let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
		let value = &rest[1..];
		return value.find(quote).map(|end| value[..end].to_string());
	}
	None
}

/// Declare the component namespace (and the stream prefix) on a bare top-level element.
fn with_namespaces(raw: &str) -> String {
	let name_end = raw[1..]
		.find(|c: char| c.is_whitespace() || c == '/' || c == '>')
		.map_or(raw.len(), |p| p + 1);
	let head_end = raw.find('>').unwrap_or(raw.len());
	let head = &raw[..head_end];

	let mut extra = String::new();
	if !head.contains("xmlns=") {
		extra.push_str(&format!(" xmlns='{NS_COMPONENT}'"));
	}
	if raw[1..name_end].starts_with("stream:") && !head.contains("xmlns:stream=") {
		extra.push_str(&format!(" xmlns:stream='{NS_STREAM}'"));
	}
	if extra.is_empty() {
		return raw.to_string();
	}
	format!("{}{}{}", &raw[..name_end], extra, &raw[name_end..])
}
