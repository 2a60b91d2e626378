use futures::StreamExt;
use orbroker_contracts::{DecodedDelta, StreamChunk};
use tracing::{debug, trace, warn};

use crate::{ByteStream, DeltaStream};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const LOG_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending_bytes: Vec<u8>,
    buffer: String,
    malformed_frames: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedDelta> {
        self.decode_utf8(chunk);

        let mut deltas = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.parse_line(&line, &mut deltas);
        }
        deltas
    }

    pub fn finish(&mut self) -> DecodedDelta {
        if !self.buffer.trim().is_empty() || !self.pending_bytes.is_empty() {
            debug!(
                event = "stream.frame.trailing_discarded",
                trailing_chars = self.buffer.chars().count(),
                trailing_bytes = self.pending_bytes.len()
            );
        }
        if self.malformed_frames > 0 {
            debug!(event = "stream.frame.malformed_total", malformed = self.malformed_frames);
        }
        self.buffer.clear();
        self.pending_bytes.clear();
        DecodedDelta::Done
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed_frames
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending_bytes.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending_bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(prefix) = std::str::from_utf8(&self.pending_bytes[..valid]) {
                        self.buffer.push_str(prefix);
                    }
                    match err.error_len() {
                        // Incomplete multi-byte sequence: wait for the next chunk.
                        None => {
                            self.pending_bytes.drain(..valid);
                            return;
                        }
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
    }

    fn parse_line(&mut self, raw: &str, deltas: &mut Vec<DecodedDelta>) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            trace!(event = "stream.frame.ignored", line = %preview(line));
            return;
        };
        let data = data.trim_start();
        if data == DONE_SENTINEL {
            return;
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.malformed_frames += 1;
                warn!(
                    event = "stream.frame.parse_failed",
                    error = %err,
                    frame = %preview(data)
                );
                return;
            }
        };

        if let Some(error) = chunk.error.as_ref() {
            warn!(
                event = "stream.frame.provider_error",
                provider_message = error.message.as_deref().unwrap_or_default()
            );
        }

        let Some(delta) = chunk.choices.into_iter().next().and_then(|choice| choice.delta) else {
            return;
        };
        if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
            deltas.push(DecodedDelta::Text(text));
        }
        let non_empty = |text: &String| !text.is_empty();
        if let Some(reasoning) =
            delta.reasoning.filter(non_empty).or(delta.reasoning_content.filter(non_empty))
        {
            deltas.push(DecodedDelta::Reasoning(reasoning));
        }
    }
}

/// Lazily decodes an SSE body. The stream always ends with `Done` unless the
/// source fails, in which case the transport error is the last item.
pub fn decode_stream(mut body: ByteStream) -> DeltaStream {
    Box::pin(async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        let mut failed = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for delta in decoder.push(&bytes) {
                        yield Ok(delta);
                    }
                }
                Err(err) => {
                    failed = true;
                    yield Err(err);
                    break;
                }
            }
        }
        if !failed {
            yield Ok(decoder.finish());
        }
    })
}

fn preview(text: &str) -> String {
    if text.chars().count() <= LOG_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}
