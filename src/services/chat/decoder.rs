//! Incremental decoder for the newline-delimited message stream.
//!
//! Bytes arrive in arbitrary chunks. A UTF-8 sequence split across chunks is
//! held back until complete, and only full lines are parsed. Each line is
//! either `data: {json}` or a bare `{json}`. Lines that do not parse (SSE
//! comments, keep-alives, `[DONE]` sentinels) are dropped.

use serde::Deserialize;
use smallvec::SmallVec;

use super::types::{StreamEvent, optional_id};

const EVENT_STREAM_PREFIX: &str = "data:";
const DEFAULT_STREAM_ERROR: &str = "An error occurred while processing your message";

pub type DecodedEvents = SmallVec<[StreamEvent; 4]>;

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "pairId", deserialize_with = "optional_id")]
    message_pair_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<WireRecord> for StreamEvent {
    fn from(record: WireRecord) -> Self {
        match record.kind.as_str() {
            "start" => StreamEvent::Start {
                pair_id: record.message_pair_id,
            },
            "text" => StreamEvent::Text {
                content: record.content.unwrap_or_default(),
            },
            "error" => StreamEvent::Error {
                message: record
                    .error
                    .or(record.content)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_STREAM_ERROR.to_string()),
            },
            "done" => StreamEvent::Done,
            "chat_id" => match record.content.filter(|c| !c.trim().is_empty()) {
                Some(chat_id) => StreamEvent::ChatId { chat_id },
                None => StreamEvent::Unknown { kind: record.kind },
            },
            _ => StreamEvent::Unknown { kind: record.kind },
        }
    }
}

/// Parse one complete line. `None` means the line carries no event.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let payload = match line.strip_prefix(EVENT_STREAM_PREFIX) {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<WireRecord>(payload) {
        Ok(record) => Some(record.into()),
        Err(err) => {
            log::trace!("Skipping undecodable stream line ({}): {}", err, payload);
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a newline.
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; every event completed by it is pushed to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut DecodedEvents) {
        self.decode_utf8(chunk);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return;
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        out.extend(complete.split('\n').filter_map(parse_line));
    }

    /// End of stream. Returns the number of bytes discarded as an incomplete record.
    pub fn finish(&mut self) -> usize {
        let discarded = self.buffer.len() + self.pending.len();
        if discarded > 0 {
            log::debug!("Discarding {} bytes of incomplete stream record", discarded);
        }
        self.buffer.clear();
        self.pending.clear();
        discarded
    }

    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || !self.pending.is_empty()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    self.buffer.push_str(valid);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = start + err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[start..valid_up_to]) {
                        self.buffer.push_str(valid);
                    }
                    match err.error_len() {
                        Some(invalid_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start = valid_up_to + invalid_len;
                        }
                        None => {
                            // Incomplete sequence at the end: keep it for the next chunk.
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = concat!(
        "data: {\"type\":\"start\",\"message_pair_id\":\"p1\"}\n\n",
        ": keep-alive\n",
        "data: {\"type\":\"text\",\"content\":\"héllo 👋 \"}\n\n",
        "{\"type\":\"text\",\"content\":\"日本語\"}\n",
        "data: {\"type\":\"done\"}\n\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = LineDecoder::new();
        let mut out = DecodedEvents::new();
        for chunk in chunks {
            decoder.push(chunk, &mut out);
        }
        decoder.finish();
        out.into_vec()
    }

    #[test]
    fn test_decodes_sse_and_bare_lines() {
        let events = decode_chunks(&[WELL_FORMED.as_bytes()]);
        assert_eq!(
            events,
            vec![
                StreamEvent::Start {
                    pair_id: Some("p1".to_string())
                },
                StreamEvent::Text {
                    content: "héllo 👋 ".to_string()
                },
                StreamEvent::Text {
                    content: "日本語".to_string()
                },
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_every_single_split_point_decodes_identically() {
        let bytes = WELL_FORMED.as_bytes();
        let expected = decode_chunks(&[bytes]);

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[a, b]), expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_decodes_identically() {
        let bytes = WELL_FORMED.as_bytes();
        let expected = decode_chunks(&[bytes]);
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), expected);

        let chunks: Vec<&[u8]> = bytes.chunks(3).collect();
        assert_eq!(decode_chunks(&chunks), expected);
    }

    #[test]
    fn test_invalid_json_does_not_halt_later_lines() {
        let events = decode_chunks(&[
            b"data: {not json\n".as_slice(),
            b"data: [DONE]\n{\"type\":\"text\",".as_slice(),
            b"\"content\":\"ok\"}\n".as_slice(),
        ]);
        assert_eq!(
            events,
            vec![StreamEvent::Text {
                content: "ok".to_string()
            }]
        );
    }

    #[test]
    fn test_residual_partial_line_is_discarded() {
        let mut decoder = LineDecoder::new();
        let mut out = DecodedEvents::new();
        decoder.push(b"{\"type\":\"done\"}\n{\"type\":\"te", &mut out);
        assert_eq!(out.len(), 1);
        assert!(decoder.has_partial());
        assert_eq!(decoder.finish(), "{\"type\":\"te".len());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_crlf_line_endings() {
        let events = decode_chunks(&[b"data: {\"type\":\"done\"}\r\n\r\n".as_slice()]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement_char() {
        let events = decode_chunks(&[b"{\"type\":\"text\",\"content\":\"a\xFFb\"}\n".as_slice()]);
        assert_eq!(
            events,
            vec![StreamEvent::Text {
                content: "a\u{FFFD}b".to_string()
            }]
        );
    }

    #[test]
    fn test_record_variants() {
        assert_eq!(
            parse_line(r#"{"type":"start","pairId":42}"#),
            Some(StreamEvent::Start {
                pair_id: Some("42".to_string())
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"start","message_pair_id":null}"#),
            Some(StreamEvent::Start { pair_id: None })
        );
        assert_eq!(
            parse_line(r#"{"type":"text"}"#),
            Some(StreamEvent::Text {
                content: String::new()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"error","error":"quota exceeded"}"#),
            Some(StreamEvent::Error {
                message: "quota exceeded".to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"error"}"#),
            Some(StreamEvent::Error {
                message: DEFAULT_STREAM_ERROR.to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"chat_id","content":"c9"}"#),
            Some(StreamEvent::ChatId {
                chat_id: "c9".to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"usage","tokens":3}"#),
            Some(StreamEvent::Unknown {
                kind: "usage".to_string()
            })
        );
        assert_eq!(parse_line(r#"{"content":"no type"}"#), None);
        assert_eq!(parse_line("data:"), None);
        assert_eq!(parse_line("   "), None);
    }
}
