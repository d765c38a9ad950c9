//! Server-Sent Events framing for upstream byte streams.
//!
//! Bytes are buffered until a full line is available, so a UTF-8 sequence or
//! a `data:` line split across network chunks is reassembled before parsing.
//! Consecutive `data:` lines of one event are joined with `\n`, and an event
//! is emitted at the blank line that ends it.

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A complete event payload with its optional `event:` name.
    Data { event: Option<String>, data: String },
    /// The `[DONE]` sentinel used by OpenAI-style upstreams.
    Done,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self::Data {
            event: None,
            data: data.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect every event they complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Called at end of input: emits an event left unterminated by the upstream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comments double as keep-alives on some aggregators.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_name = Some(value.to_string()),
            // Bare JSON lines without framing.
            _ if line.starts_with('{') => {
                self.data_lines.push(line.to_string());
                return self.dispatch();
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_name = None;
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        let event = self.event_name.take();

        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }
        Some(SseEvent::Data { event, data })
    }
}
