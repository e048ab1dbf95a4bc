//! Server-sent event wire codec
//!
//! The coordinator consumes worker streams as raw HTTP chunks and needs to
//! reassemble them into frames before re-emitting to its own subscribers.
//! This module implements the line-oriented SSE framing: `event:`, `data:`
//! and `id:` fields, frames terminated by a blank line. Chunk boundaries are
//! arbitrary, so the parser is incremental and keeps partial frames buffered
//! between feeds.

/// One parsed SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name from the `event:` field, if present
    pub event: Option<String>,
    /// Payload assembled from `data:` lines, joined with newlines
    pub data: String,
    /// Frame id from the `id:` field, if present
    pub id: Option<String>,
}

impl SseFrame {
    /// Render the frame in wire format, terminated by the blank line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental SSE parser.
///
/// Feed it raw bytes as they arrive; it returns every frame completed by the
/// new data and buffers the rest. Bytes are buffered raw so that a UTF-8
/// sequence split across chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser { buffer: Vec::new() }
    }

    /// Feed a chunk of bytes, returning all frames completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let Some((frame_end, separator_len)) = find_frame_boundary(&self.buffer) else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..frame_end + separator_len).collect();
            let text = String::from_utf8_lossy(&raw[..frame_end]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Number of buffered bytes awaiting a frame terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Locate the first blank-line frame terminator, returning the end offset of
/// the frame body and the terminator length. Both `\n\n` and `\r\n\r\n` are
/// accepted.
fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

/// Parse one frame body (terminator already stripped). Returns None for
/// comment-only frames.
fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut id = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            // Blank lines inside the body cannot occur; leading-colon lines
            // are comments (used by some servers as keep-alives).
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => id = Some(value.to_string()),
            // `retry:` and unknown fields are ignored
            _ => {}
        }
    }

    if event.is_none() && id.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_frame() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"event: progress\ndata: {\"pct\":10}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("progress"));
        assert_eq!(frames[0].data, "{\"pct\":10}");
        assert_eq!(parser.pending_len(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: com").is_empty());
        assert!(parser.feed(b"plete\ndata: {}").is_empty());
        let frames = parser.feed(b"\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("complete"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: one\n\ndata: two\n\ndata: thr");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].data, "two");
        assert!(parser.pending_len() > 0);
    }

    #[test]
    fn test_multi_line_data_joined() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn test_crlf_framing() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"event: status\r\ndata: ok\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("status"));
        assert_eq!(frames[0].data, "ok");
    }

    #[test]
    fn test_comment_frames_are_skipped() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b": keep-alive\n\ndata: real\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "real");
    }

    #[test]
    fn test_id_field_and_no_space_after_colon() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id:42\ndata:payload\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("42"));
        assert_eq!(frames[0].data, "payload");
    }

    #[test]
    fn test_serialize_round_trip() {
        let frame = SseFrame {
            event: Some("progress".to_string()),
            data: "{\"a\":1}".to_string(),
            id: None,
        };
        let mut parser = SseParser::new();
        let frames = parser.feed(frame.serialize().as_bytes());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_serialize_multi_line_data() {
        let frame = SseFrame {
            event: None,
            data: "a\nb".to_string(),
            id: None,
        };
        assert_eq!(frame.serialize(), "data: a\ndata: b\n\n");
    }
}
