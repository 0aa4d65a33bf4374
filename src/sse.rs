use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// Incremental decoder for an OpenAI-style chat completion event stream.
// Chunks may split lines anywhere; only complete lines are interpreted.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    // longest partial line kept before it is thrown away
    ceiling: usize,
    // inside an oversized line, waiting for its newline
    skipping: bool,
    done: bool,
    touched: Instant,
}

impl SseDecoder {
    pub fn new(ceiling: usize) -> Self {
        Self {
            pending: Vec::new(),
            ceiling,
            skipping: false,
            done: false,
            touched: Instant::now(),
        }
    }

    // tool-call argument fragments count as text too
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.touched = Instant::now();
        let mut chunk = chunk;
        if self.skipping {
            let Some(newline) = chunk.iter().position(|b| *b == b'\n') else {
                return Vec::new();
            };
            self.skipping = false;
            chunk = &chunk[newline + 1..];
        }
        self.pending.extend_from_slice(chunk);
        let mut deltas = Vec::new();

        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(data) = line.strip_prefix("data:") else {
                // comments, event names, ids and blank separators
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(event) => deltas.extend(event_text(&event)),
                Err(e) => debug!(error = %e, "skipping undecodable event"),
            }
        }

        if self.pending.len() > self.ceiling {
            warn!(
                bytes = self.pending.len(),
                ceiling = self.ceiling,
                "dropping oversized event line"
            );
            self.pending = Vec::new();
            self.skipping = true;
        }
        deltas
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn idle_for(&self) -> Duration {
        self.touched.elapsed()
    }
}

fn event_text(event: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(choices) = event.get("choices").and_then(Value::as_array) else {
        return out;
    };
    for choice in choices {
        let Some(delta) = choice.get("delta") else { continue };
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                out.push(content.to_string());
            }
        }
        let calls = delta.get("tool_calls").and_then(Value::as_array);
        for call in calls.into_iter().flatten() {
            if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                if !args.is_empty() {
                    out.push(args.to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: usize = 256 * 1024;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
        )
    }

    #[test]
    fn decodes_content_across_split_chunks() {
        let stream = format!("{}{}data: [DONE]\n\n", frame("Here: image:{a red"), frame(" fox}"));
        let bytes = stream.as_bytes();
        let (a, b) = bytes.split_at(17);

        let mut decoder = SseDecoder::new(CEILING);
        let mut text = decoder.feed(a).concat();
        assert!(!decoder.is_done());
        text.push_str(&decoder.feed(b).concat());

        assert_eq!(text, "Here: image:{a red fox}");
        assert!(decoder.is_done());
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let stream = frame("café ☕");
        let bytes = stream.as_bytes();
        let split = stream.find('☕').unwrap() + 1;

        let mut decoder = SseDecoder::new(CEILING);
        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec!["café ☕".to_string()]);
    }

    #[test]
    fn tool_call_arguments_are_text() {
        let event = serde_json::json!({ "choices": [{ "delta": { "tool_calls": [
            { "index": 0, "function": { "arguments": "{\"prompt\": \"a li" } }
        ]}}]});
        let mut decoder = SseDecoder::new(CEILING);
        let out = decoder.feed(format!("data: {}\r\n\r\n", event).as_bytes());
        assert_eq!(out, vec!["{\"prompt\": \"a li".to_string()]);
    }

    #[test]
    fn oversized_line_is_dropped_and_decoding_resumes() {
        let mut decoder = SseDecoder::new(CEILING);
        let junk = vec![b'x'; 64 * 1024];
        for _ in 0..64 {
            assert!(decoder.feed(&junk).is_empty());
            assert!(decoder.pending.len() <= CEILING);
        }

        // the tail of the long line goes too, the next event decodes
        let out = decoder.feed(format!("xxxx\n{}", frame("still here")).as_bytes());
        assert_eq!(out, vec!["still here".to_string()]);
        assert!(decoder.pending.is_empty());
    }

    #[test]
    fn ignores_comments_and_garbage() {
        let mut decoder = SseDecoder::new(CEILING);
        let out = decoder.feed(b": keep-alive\nevent: ping\ndata: {not json\n\n");
        assert!(out.is_empty());
        assert!(!decoder.is_done());
    }
}
