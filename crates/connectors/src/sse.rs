//! Minimal server-sent-events framing for streamed completions

/// Splits a byte stream into `data:` payloads.
///
/// Chunks may end mid-line; the remainder is kept until the next push.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }

    /// Payload left in the buffer when the stream ends without a newline
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        rest.trim()
            .strip_prefix("data:")
            .map(|data| data.trim_start().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::SseDecoder;

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\n\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn ignores_comments_and_event_names() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b": keep-alive\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(out, vec!["x"]);
    }

    #[test]
    fn flushes_trailing_payload() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }
}
