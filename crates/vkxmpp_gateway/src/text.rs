#![forbid(unsafe_code)]

/// Drop characters XML 1.0 cannot carry. Markup escaping happens at serialization.
pub fn escape(text: &str) -> String {
	text.chars()
		.filter(|&c| {
			let code = c as u32;
			!(code < 0x20 && !matches!(c, '\t' | '\n' | '\r')) && c != '\u{FFFE}' && c != '\u{FFFF}'
		})
		.collect()
}

/// Decode the entity subset the remote API emits and turn `<br>` into newlines.
pub fn unescape_html(text: &str) -> String {
	let text = text.replace("<br>", "\n").replace("<br/>", "\n").replace("<br />", "\n");
	let mut out = String::with_capacity(text.len());
	let mut rest = text.as_str();

	while let Some(pos) = rest.find('&') {
		out.push_str(&rest[..pos]);
		let tail = &rest[pos..];
		match tail.find(';').filter(|&end| end <= 10).and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end))) {
			Some((c, end)) => {
				out.push(c);
				rest = &tail[end + 1..];
			}
			None => {
				out.push('&');
				rest = &tail[1..];
			}
		}
	}
	out.push_str(rest);
	out
}

fn decode_entity(name: &str) -> Option<char> {
	match name {
		"amp" => Some('&'),
		"lt" => Some('<'),
		"gt" => Some('>'),
		"quot" => Some('"'),
		"apos" => Some('\''),
		_ => {
			let num = name.strip_prefix('#')?;
			let code = match num.strip_prefix(['x', 'X']) {
				Some(hex) => u32::from_str_radix(hex, 16).ok()?,
				None => num.parse().ok()?,
			};
			char::from_u32(code)
		}
	}
}
