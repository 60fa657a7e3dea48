//! Incremental decoder for the assistant's `event:`/`data:` stream.
//!
//! Frames are separated by a blank line. Bytes after the last separator are
//! kept and completed by later pushes, so the decoded sequence does not depend
//! on how the transport chunked the body.

use super::ProtocolEvent;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    scan_from: usize,
    dropped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event whose frame completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        let mut from = self.scan_from;
        while let Some((end, len)) = find_separator(&self.buffer, from) {
            if let Some(event) = self.decode_frame(start, end) {
                events.push(event);
            }
            start = end + len;
            from = start;
        }

        self.buffer.drain(..start);
        // A separator may straddle this chunk and the next one.
        self.scan_from = self.buffer.len().saturating_sub(2);
        events
    }

    /// Ends the stream. An incomplete trailing frame is discarded and the
    /// decoder is ready for the next stream.
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        if self.buffer.iter().any(|b| !b.is_ascii_whitespace()) {
            debug!(bytes = self.buffer.len(), "dropping incomplete trailing frame");
        }
        if self.dropped > 0 {
            warn!(dropped = self.dropped, "stream finished with undecodable frames");
        }
        self.buffer.clear();
        self.scan_from = 0;
        self.dropped = 0;
        Vec::new()
    }

    /// Frames dropped since the last `finish`.
    #[cfg(test)]
    fn dropped(&self) -> usize {
        self.dropped
    }

    fn decode_frame(&mut self, start: usize, end: usize) -> Option<ProtocolEvent> {
        let text = String::from_utf8_lossy(&self.buffer[start..end]);
        if text.trim().is_empty() {
            return None;
        }

        let mut event = None;
        let mut data = None;
        for line in text.lines() {
            if let Some(value) = field(line, "event") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = field(line, "data") {
                match serde_json::from_str::<serde_json::Value>(value) {
                    Ok(parsed) => data = Some(parsed),
                    Err(e) => {
                        warn!(error = %e, "malformed data line in stream frame");
                        self.dropped += 1;
                        return None;
                    }
                }
            }
        }

        let (Some(event), Some(data)) = (event, data) else {
            debug!(frame = %text, "frame without event type or data, skipping");
            return None;
        };

        match ProtocolEvent::from_frame(&event, data) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                self.dropped += 1;
                None
            }
        }
    }
}

/// Finds the next blank-line separator at or after `from`.
/// Returns the index where the frame ends and the separator length.
fn find_separator(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            match (buffer.get(i + 1), buffer.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SCENARIO: &str = "event: init\ndata: {\"conversation_id\":\"c1\"}\n\n\
                            event: text_chunk\ndata: {\"delta\":\"Hi\"}\n\n\
                            event: text_chunk\ndata: {\"delta\":\" there\"}\n\n";

    fn decode_all(chunks: &[&[u8]]) -> Vec<ProtocolEvent> {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    fn expected() -> Vec<ProtocolEvent> {
        vec![
            ProtocolEvent::Init {
                conversation_id: "c1".into(),
            },
            ProtocolEvent::TextChunk { delta: "Hi".into() },
            ProtocolEvent::TextChunk {
                delta: " there".into(),
            },
        ]
    }

    #[test]
    fn decodes_whole_payload() {
        assert_eq!(decode_all(&[SCENARIO.as_bytes()]), expected());
    }

    #[test]
    fn decodes_one_byte_at_a_time() {
        let chunks: Vec<&[u8]> = SCENARIO.as_bytes().chunks(1).collect();
        assert_eq!(decode_all(&chunks), expected());
    }

    #[test]
    fn partial_frame_waits_for_separator() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder
            .push(b"event: text_chunk\ndata: {\"delta\":\"He")
            .is_empty());
        assert!(decoder.push(b"l\"}\n").is_empty());
        assert_eq!(
            decoder.push(b"\nevent: text_chunk\n"),
            vec![ProtocolEvent::TextChunk { delta: "Hel".into() }]
        );
    }

    #[test]
    fn malformed_json_drops_only_that_frame() {
        let payload = "event: text_chunk\ndata: {\"delta\":\"a\"}\n\n\
                       event: text_chunk\ndata: {\"delta\": oops}\n\n\
                       event: text_chunk\ndata: {\"delta\":\"b\"}\n\n";
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(payload.as_bytes());
        assert_eq!(
            events,
            vec![
                ProtocolEvent::TextChunk { delta: "a".into() },
                ProtocolEvent::TextChunk { delta: "b".into() },
            ]
        );
        assert_eq!(decoder.dropped(), 1);
        decoder.finish();
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn incomplete_trailing_frame_is_discarded_on_finish() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(b"event: text_chunk\ndata: {\"delta\":\"x\"}\n\nevent: text_chunk\ndata: {\"delta\":\"y\"}");
        assert_eq!(events.len(), 1);
        assert!(decoder.finish().is_empty());
        assert!(decoder.push(b"\n\n").is_empty());
    }

    #[test]
    fn data_only_error_frame_is_skipped() {
        let payload = "data: {\"error\": \"Conversation not found\"}\n\n";
        assert!(decode_all(&[payload.as_bytes()]).is_empty());
    }

    #[test]
    fn unknown_event_is_passed_through() {
        let payload = "event: message_end\ndata: {\"full_text\":\"Hi\"}\n\n\
                       event: thinking\ndata: {\"step\":1}\n\n";
        let events = decode_all(&[payload.as_bytes()]);
        assert_eq!(
            events[0],
            ProtocolEvent::MessageEnd {
                full_text: "Hi".into()
            }
        );
        assert_eq!(events[1].name(), "thinking");
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let payload = "event: text_chunk\r\ndata: {\"delta\":\"a\"}\r\n\r\nevent: text_chunk\r\ndata: {\"delta\":\"b\"}\r\n\r\n";
        let chunks: Vec<&[u8]> = payload.as_bytes().chunks(3).collect();
        assert_eq!(
            decode_all(&chunks),
            vec![
                ProtocolEvent::TextChunk { delta: "a".into() },
                ProtocolEvent::TextChunk { delta: "b".into() },
            ]
        );
    }

    #[test]
    fn multibyte_text_split_inside_a_character() {
        let payload = "event: text_chunk\ndata: {\"delta\":\"京都へ\"}\n\n".as_bytes();
        let split = payload.iter().position(|&b| b >= 0x80).unwrap() + 1;
        let events = decode_all(&[&payload[..split], &payload[split..]]);
        assert_eq!(events, vec![ProtocolEvent::TextChunk { delta: "京都へ".into() }]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(mut cuts in proptest::collection::vec(0usize..=SCENARIO.len(), 0..12)) {
            cuts.sort_unstable();
            cuts.dedup();
            let bytes = SCENARIO.as_bytes();
            let mut chunks = Vec::new();
            let mut last = 0;
            for cut in cuts {
                chunks.push(&bytes[last..cut]);
                last = cut;
            }
            chunks.push(&bytes[last..]);
            prop_assert_eq!(decode_all(&chunks), expected());
        }
    }
}
