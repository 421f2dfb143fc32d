use tracing::debug;

/// One decoded unit of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// Event kind: the payload's `type` field, else the SSE `event:` name,
    /// else `message`.
    pub kind: String,
    /// JSON-decoded payload.
    pub payload: serde_json::Value,
}

/// Incremental decoder for blank-line delimited `data:` frames.
///
/// Pure and synchronous. Feeding the same bytes in any chunking yields the
/// same frames in the same order; an unterminated tail stays buffered until a
/// later `feed` completes it. `\r\n`, `\r` and `\n` all end a line.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scan_from: usize,
    after_cr: bool,
}

impl FrameDecoder {
    /// Appends `chunk` and returns every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<EventFrame> {
        self.push_normalized(chunk);
        let mut frames = Vec::new();
        while let Some(idx) = find_blank_line(&self.buf, self.scan_from) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + 2).take(idx).collect();
            self.scan_from = 0;
            if let Some(frame) = parse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        // The next chunk may finish a blank line started by the last byte.
        self.scan_from = self.buf.len().saturating_sub(1);
        frames
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    // Folds every line ending into `\n`. A `\r\n` pair split across chunks
    // is still one line ending.
    fn push_normalized(&mut self, chunk: &[u8]) {
        self.buf.reserve(chunk.len());
        for &byte in chunk {
            match byte {
                b'\r' => {
                    self.buf.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.buf.push(byte);
                    self.after_cr = false;
                }
            }
        }
    }
}

fn find_blank_line(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|pos| pos + from)
}

struct RawFrame {
    event: Option<String>,
    data: String,
}

fn split_fields(bytes: &[u8]) -> Option<RawFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // id:, retry: and unknown fields are ignored.
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(RawFrame {
        event,
        data: data_lines.join("\n"),
    })
}

fn parse_frame(bytes: &[u8]) -> Option<EventFrame> {
    let raw = split_fields(bytes)?;
    let data = raw.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let payload: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, bytes = data.len(), "dropping undecodable stream frame");
            return None;
        }
    };
    let kind = payload
        .get("type")
        .or_else(|| payload.get("event"))
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
        .or(raw.event.filter(|e| !e.is_empty()))
        .unwrap_or_else(|| "message".to_string());
    Some(EventFrame { kind, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b": keep-alive\n\n\
        data: {\"type\":\"start\",\"run_id\":\"r1\",\"node_id\":\"a\"}\n\n\
        event: progress\r\ndata: {\"progress\":10,\r\ndata: \"node_id\":\"a\"}\r\n\r\n\
        data: {not json}\n\n\
        id: 7\ndata: {\"type\":\"complete\",\"node_id\":\"a\"}\n\n\
        data: [DONE]\n\n\
        data: {\"type\":\"run_finished\"}\n\n\
        data: {\"type\":\"tail\"";

    fn kinds(frames: &[EventFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.kind.as_str()).collect()
    }

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = FrameDecoder::default();
        let frames1 = decoder.feed(b"event: message\ndata: {\"type\":\"progress\",\"progress\":4");
        assert!(frames1.is_empty());
        let frames2 = decoder.feed(b"2}\n\n");
        assert_eq!(frames2.len(), 1);
        assert_eq!(frames2[0].kind, "progress");
        assert_eq!(frames2[0].payload["progress"], 42);
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let mut whole = FrameDecoder::default();
        let expected = whole.feed(STREAM);

        let mut single = FrameDecoder::default();
        let mut actual = Vec::new();
        for byte in STREAM {
            actual.extend(single.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(kinds(&expected), vec!["start", "progress", "complete", "run_finished"]);
        assert_eq!(actual, expected);
        assert_eq!(single.pending_len(), whole.pending_len());
    }

    #[test]
    fn arbitrary_chunk_sizes_match_whole_buffer() {
        let mut whole = FrameDecoder::default();
        let expected = whole.feed(STREAM);
        for size in [2, 3, 5, 7, 13, 64] {
            let mut decoder = FrameDecoder::default();
            let mut actual = Vec::new();
            for chunk in STREAM.chunks(size) {
                actual.extend(decoder.feed(chunk));
            }
            assert_eq!(actual, expected, "chunk size {size}");
        }
    }

    #[test]
    fn multi_line_data_is_joined_before_decoding() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"data: {\"type\":\"progress\",\ndata: \"progress\":60}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["progress"], 60);
    }

    #[test]
    fn incomplete_tail_is_never_emitted() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.feed(b"data: {\"type\":\"start\"}\n").is_empty());
        assert!(decoder.pending_len() > 0);
        let frames = decoder.feed(b"\n");
        assert_eq!(kinds(&frames), vec!["start"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn malformed_frame_is_dropped_and_decoding_continues() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"data: {oops\n\ndata: {\"type\":\"paused\"}\n\n");
        assert_eq!(kinds(&frames), vec!["paused"]);
    }

    #[test]
    fn mixed_line_endings_still_end_frames() {
        let input: &[u8] = b"data: {\"type\":\"start\"}\n\r\n\
            data: {\"type\":\"progress\",\rdata: \"progress\":5}\r\r\
            data: {\"type\":\"complete\",\"node_id\":\"a\"}\r\n\r\n";
        let mut whole = FrameDecoder::default();
        let expected = whole.feed(input);
        assert_eq!(kinds(&expected), vec!["start", "progress", "complete"]);
        assert_eq!(expected[1].payload["progress"], 5);
        assert_eq!(whole.pending_len(), 0);

        for size in [1, 2, 3] {
            let mut decoder = FrameDecoder::default();
            let mut actual = Vec::new();
            for chunk in input.chunks(size) {
                actual.extend(decoder.feed(chunk));
            }
            assert_eq!(actual, expected, "chunk size {size}");
        }
    }

    #[test]
    fn kind_falls_back_to_event_name_then_message() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(b"event: progress\ndata: {\"progress\":1}\n\ndata: {\"x\":1}\n\n");
        assert_eq!(kinds(&frames), vec!["progress", "message"]);
    }
}
