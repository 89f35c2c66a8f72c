//! Reassembly of upstream frames from arbitrarily split byte chunks.
//!
//! Network reads do not respect frame boundaries: a read may end mid-line or
//! in the middle of a multi-byte UTF-8 sequence. [`FrameDecoder`] keeps the
//! undelimited tail between reads and only hands a line to the JSON parser
//! once its terminating `\n` has arrived.

use super::upstream_types::{UpstreamFrame, FRAME_PREFIX};

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes before this offset are known to contain no newline.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<UpstreamFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            if let Some(frame) = parse_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            search_from = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Flush the undelimited remainder once the upstream has closed.
    pub fn finish(&mut self) -> Option<UpstreamFrame> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_line(&rest)
    }

    /// Bytes received but not yet terminated by a newline.
    #[cfg(test)]
    fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

fn parse_line(raw: &[u8]) -> Option<UpstreamFrame> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }

    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, len = raw.len(), "Skipping frame line with invalid UTF-8");
            return None;
        }
    };

    let payload = line.strip_prefix(FRAME_PREFIX)?;
    match UpstreamFrame::parse(payload) {
        Ok(frame) => {
            tracing::debug!(?frame, "Received upstream frame");
            Some(frame)
        }
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "Skipping unparseable frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "data: {\"code\":201,\"data\":{\"clId\":\"c-1\"}}\n",
        "\n",
        "data: {\"code\":202,\"data\":{\"type\":\"chat\",\"content\":\"你好\"}}\n",
        "data: {\"code\":202,\"data\":{\"type\":\"chat\",\"content\":\", world\"}}\n",
        "data: {\"code\":203}\n",
    );

    #[test]
    fn test_whole_stream_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(STREAM.as_bytes());
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], UpstreamFrame::StreamEnd);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_one_byte_at_a_time_matches_single_chunk() {
        let mut whole = FrameDecoder::new();
        let expected = whole.push(STREAM.as_bytes());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in STREAM.as_bytes() {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_split_inside_utf8_sequence_waits_for_rest() {
        let bytes = STREAM.as_bytes();
        // "你" is three bytes; cut after its first byte
        let cut = STREAM.find('你').unwrap() + 1;

        let mut decoder = FrameDecoder::new();
        let first = decoder.push(&bytes[..cut]);
        assert_eq!(first.len(), 1);
        assert!(!decoder.pending().is_empty());

        let rest = decoder.push(&bytes[cut..]);
        assert_eq!(
            rest[0],
            UpstreamFrame::ContentDelta {
                kind: "chat".to_string(),
                content: "你好".to_string(),
                reasoning_content: String::new(),
            }
        );
    }

    #[test]
    fn test_malformed_and_foreign_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b"event: ping\ndata: {not json\ndata: {\"code\":203}\r\n: comment\n",
        );
        assert_eq!(frames, vec![UpstreamFrame::StreamEnd]);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped_without_stalling() {
        let mut decoder = FrameDecoder::new();
        let mut input = b"data: \xff\xfe\n".to_vec();
        input.extend_from_slice(b"data: {\"code\":203}\n");
        assert_eq!(decoder.push(&input), vec![UpstreamFrame::StreamEnd]);
    }

    #[test]
    fn test_finish_flushes_undelimited_tail() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"code\":20").is_empty());
        assert!(decoder.push(b"3}").is_empty());
        assert_eq!(decoder.finish(), Some(UpstreamFrame::StreamEnd));
        assert!(decoder.pending().is_empty());
        assert_eq!(decoder.finish(), None);
    }
}
