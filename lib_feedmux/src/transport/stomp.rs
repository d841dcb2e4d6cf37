//! STOMP 1.2 frame codec (the subset the WebSocket link speaks).
//!
//! A frame is `COMMAND\nheader:value\n...\n\nbody\0`. A text message made of
//! end-of-line characters only is a heart-beat.

use std::collections::BTreeMap;

use crate::error::{FeedError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Result of decoding one WebSocket text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(StompFrame),
    Heartbeat,
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(&escape(name));
            out.push(':');
            out.push_str(&escape(value));
            out.push('\n');
        }
        if !self.body.is_empty() && !self.headers.contains_key("content-length") {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decodes one WebSocket text message.
pub fn decode(text: &str) -> Result<Decoded> {
    let trimmed = text.trim_start_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Ok(Decoded::Heartbeat);
    }

    let (head, body) = match trimmed.find("\n\n") {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 2..]),
        None => match trimmed.find("\r\n\r\n") {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 4..]),
            None => return Err(FeedError::Parse("STOMP frame without header terminator".to_string())),
        },
    };

    let mut lines = head.lines();
    let command = lines
        .next()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FeedError::Parse("STOMP frame without command".to_string()))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            // Repeated headers: the first occurrence wins.
            headers.entry(unescape(name)).or_insert_with(|| unescape(value));
        }
    }

    let body = match headers.get("content-length").and_then(|l| l.parse::<usize>().ok()) {
        Some(len) if len <= body.len() && body.is_char_boundary(len) => &body[..len],
        _ => body.split('\0').next().unwrap_or_default(),
    };

    Ok(Decoded::Frame(StompFrame {
        command,
        headers,
        body: body.to_string(),
    }))
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace(':', "\\c")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_decodes_destination_and_body() {
        let raw = "MESSAGE\ndestination:/snap/pos/abc\nsubscription:sub-0\n\n[{\"id\":1}]\0";
        match decode(raw).unwrap() {
            Decoded::Frame(frame) => {
                assert_eq!(frame.command, "MESSAGE");
                assert_eq!(frame.get("destination"), Some("/snap/pos/abc"));
                assert_eq!(frame.body, "[{\"id\":1}]");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eol_only_is_a_heartbeat() {
        assert_eq!(decode("\n").unwrap(), Decoded::Heartbeat);
        assert_eq!(decode("\r\n\n").unwrap(), Decoded::Heartbeat);
    }

    #[test]
    fn send_frame_encodes_content_length_and_escapes_headers() {
        let encoded = StompFrame::new("SEND")
            .header("destination", "/snap/pos/abc/1000")
            .header("x-note", "a:b")
            .body("START")
            .encode();
        assert!(encoded.starts_with("SEND\n"));
        assert!(encoded.contains("content-length:5\n"));
        assert!(encoded.contains("x-note:a\\cb\n"));
        assert!(encoded.ends_with("\n\nSTART\0"));
    }

    #[test]
    fn content_length_bounds_a_body_containing_nul() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        match decode(raw).unwrap() {
            Decoded::Frame(frame) => assert_eq!(frame.body, "a\0b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frame_without_blank_line_is_rejected() {
        assert_eq!(decode("MESSAGE\ndestination:/x").unwrap_err().kind(), "parse");
    }
}
