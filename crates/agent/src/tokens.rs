use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use serde::Deserialize;

/// Process-wide cumulative token counters, read by the status surface.
/// Monotonically non-decreasing.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    input: AtomicI64,
    output: AtomicI64,
}

impl GlobalCounters {
    pub fn totals(&self) -> (i64, i64) {
        (
            self.input.load(Ordering::Relaxed),
            self.output.load(Ordering::Relaxed),
        )
    }
}

/// Which streaming dialect a request path speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    Unknown,
    Ollama,
    OpenAiChat,
    Anthropic,
    OpenAiResponses,
}

pub fn detect_api_style(path: &str) -> ApiStyle {
    if path.starts_with("/api/generate") || path.starts_with("/api/chat") {
        ApiStyle::Ollama
    } else if path.starts_with("/v1/chat/completions") {
        ApiStyle::OpenAiChat
    } else if path.starts_with("/v1/messages") {
        ApiStyle::Anthropic
    } else if path.starts_with("/v1/responses") {
        ApiStyle::OpenAiResponses
    } else {
        ApiStyle::Unknown
    }
}

fn monotonic_nanos() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

#[derive(Default)]
struct LineState {
    buf: String,
    last_event: String,
}

/// Per-request streaming token counter. Fed byte chunks by the proxy's
/// parser task; the output counter and timing anchors are atomic so the
/// rate ticker can read them from another task mid-stream.
///
/// Malformed frames are skipped silently; counting is best-effort and must
/// never fail a request.
pub struct TokenParser {
    style: ApiStyle,
    line: Mutex<LineState>,
    input: AtomicI64,
    output: AtomicI64,
    /// Tokens observed as streaming deltas only; unlike `output` this is
    /// never corrected by authoritative API counts, so rates stay smooth.
    streamed: AtomicI64,
    upstream_start_nanos: AtomicI64,
    first_output_nanos: AtomicI64,
    last_output_nanos: AtomicI64,
}

impl TokenParser {
    pub fn new(path: &str) -> Self {
        Self {
            style: detect_api_style(path),
            line: Mutex::new(LineState::default()),
            input: AtomicI64::new(0),
            output: AtomicI64::new(0),
            streamed: AtomicI64::new(0),
            upstream_start_nanos: AtomicI64::new(0),
            first_output_nanos: AtomicI64::new(0),
            last_output_nanos: AtomicI64::new(0),
        }
    }

    pub fn style(&self) -> ApiStyle {
        self.style
    }

    /// Records when the upstream request was sent; anchors the input rate.
    pub fn mark_upstream_start(&self) {
        self.upstream_start_nanos
            .store(monotonic_nanos(), Ordering::Relaxed);
    }

    /// Consume one response chunk. Complete `\n`-terminated lines are parsed
    /// in order; a trailing `\r` is stripped; partial lines wait for more.
    pub fn feed(&self, data: &[u8], globals: &GlobalCounters) {
        if self.style == ApiStyle::Unknown {
            return;
        }

        let mut state = self.line.lock().expect("token parser lock poisoned");
        state.buf.push_str(&String::from_utf8_lossy(data));

        while let Some(idx) = state.buf.find('\n') {
            let rest = state.buf.split_off(idx + 1);
            let mut line = std::mem::replace(&mut state.buf, rest);
            line.truncate(idx);
            let line = line.strip_suffix('\r').map(str::to_owned).unwrap_or(line);
            self.process_line(&mut state, &line, globals);
        }
    }

    /// Final (input, output) counts for this request.
    pub fn counts(&self) -> (i64, i64) {
        (
            self.input.load(Ordering::Relaxed),
            self.output.load(Ordering::Relaxed),
        )
    }

    /// Prompt-eval tokens per second, estimated as input ÷ time-to-first-token.
    /// Zero until both the input count and the first output are known.
    pub fn input_rate(&self) -> f64 {
        let input = self.input.load(Ordering::Relaxed);
        if input == 0 {
            return 0.0;
        }
        let start = self.upstream_start_nanos.load(Ordering::Relaxed);
        let first = self.first_output_nanos.load(Ordering::Relaxed);
        if start == 0 || first == 0 || first <= start {
            return 0.0;
        }
        input as f64 / ((first - start) as f64 / 1e9)
    }

    /// Output tokens per second over the streamed window; safe to call from
    /// any task while the stream is in flight.
    pub fn live_output_rate(&self) -> f64 {
        let streamed = self.streamed.load(Ordering::Relaxed);
        if streamed <= 1 {
            return 0.0;
        }
        let first = self.first_output_nanos.load(Ordering::Relaxed);
        let last = self.last_output_nanos.load(Ordering::Relaxed);
        if first == 0 || last == 0 || last <= first {
            return 0.0;
        }
        streamed as f64 / ((last - first) as f64 / 1e9)
    }

    fn count_output(&self, globals: &GlobalCounters) {
        let now = monotonic_nanos();
        let _ = self
            .first_output_nanos
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
        self.last_output_nanos.store(now, Ordering::Relaxed);
        self.output.fetch_add(1, Ordering::Relaxed);
        self.streamed.fetch_add(1, Ordering::Relaxed);
        globals.output.fetch_add(1, Ordering::Relaxed);
    }

    /// Adopts the provider-reported input count, at most once per request.
    fn adopt_input(&self, value: i64, globals: &GlobalCounters) {
        if value <= 0 {
            return;
        }
        if self
            .input
            .compare_exchange(0, value, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            globals.input.fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Replaces the streaming output count with the provider's authoritative
    /// number, applying the difference to the global counter as well.
    fn correct_output(&self, authoritative: i64, globals: &GlobalCounters) {
        if authoritative <= 0 {
            return;
        }
        let counted = self.output.load(Ordering::Relaxed);
        let diff = authoritative - counted;
        if diff != 0 {
            self.output.fetch_add(diff, Ordering::Relaxed);
            globals.output.fetch_add(diff, Ordering::Relaxed);
        }
    }

    fn process_line(&self, state: &mut LineState, line: &str, globals: &GlobalCounters) {
        match self.style {
            ApiStyle::Ollama => self.parse_ollama_line(line, globals),
            ApiStyle::OpenAiChat => self.parse_openai_chat_line(line, globals),
            ApiStyle::Anthropic => self.parse_anthropic_line(state, line, globals),
            ApiStyle::OpenAiResponses => self.parse_openai_responses_line(state, line, globals),
            ApiStyle::Unknown => {}
        }
    }

    // Ollama native (/api/generate, /api/chat): each line is a JSON object.
    // Non-done lines with content count one output token; the done line
    // carries prompt_eval_count.
    fn parse_ollama_line(&self, line: &str, globals: &GlobalCounters) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        #[derive(Deserialize)]
        struct ChatMessage {
            #[serde(default)]
            content: String,
        }
        #[derive(Deserialize)]
        struct Frame {
            #[serde(default)]
            done: bool,
            #[serde(default)]
            response: String,
            message: Option<ChatMessage>,
            #[serde(default)]
            prompt_eval_count: i64,
        }

        let Ok(frame) = serde_json::from_str::<Frame>(line) else {
            return;
        };

        if frame.done {
            // Output tokens were already counted per chunk.
            self.adopt_input(frame.prompt_eval_count, globals);
            return;
        }

        let has_content = !frame.response.is_empty()
            || frame.message.map(|m| !m.content.is_empty()).unwrap_or(false);
        if has_content {
            self.count_output(globals);
        }
    }

    // OpenAI Chat (/v1/chat/completions): "data: {...}" SSE lines, [DONE]
    // terminator. content or reasoning_content deltas count one token each.
    fn parse_openai_chat_line(&self, line: &str, globals: &GlobalCounters) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        if data == "[DONE]" {
            return;
        }

        #[derive(Default, Deserialize)]
        struct Delta {
            #[serde(default)]
            content: String,
            #[serde(default)]
            reasoning_content: String,
        }
        #[derive(Deserialize)]
        struct Choice {
            #[serde(default)]
            delta: Delta,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            prompt_tokens: i64,
        }
        #[derive(Deserialize)]
        struct Frame {
            #[serde(default)]
            choices: Vec<Choice>,
            usage: Option<Usage>,
        }

        let Ok(frame) = serde_json::from_str::<Frame>(data) else {
            return;
        };

        if let Some(choice) = frame.choices.first() {
            if !choice.delta.content.is_empty() || !choice.delta.reasoning_content.is_empty() {
                self.count_output(globals);
            }
        }

        if let Some(usage) = frame.usage {
            self.adopt_input(usage.prompt_tokens, globals);
        }
    }

    // Anthropic Messages (/v1/messages): "event: <name>" / "data: {...}"
    // pairs. message_start carries input tokens, content_block_delta counts
    // output, message_delta carries the authoritative output total.
    fn parse_anthropic_line(&self, state: &mut LineState, line: &str, globals: &GlobalCounters) {
        if let Some(event) = line.strip_prefix("event: ") {
            state.last_event = event.to_string();
            return;
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };

        match state.last_event.as_str() {
            "message_start" => {
                #[derive(Deserialize)]
                struct Usage {
                    #[serde(default)]
                    input_tokens: i64,
                }
                #[derive(Deserialize)]
                struct Message {
                    #[serde(default)]
                    usage: Option<Usage>,
                }
                #[derive(Deserialize)]
                struct Frame {
                    message: Option<Message>,
                }
                if let Ok(frame) = serde_json::from_str::<Frame>(data) {
                    if let Some(usage) = frame.message.and_then(|m| m.usage) {
                        self.adopt_input(usage.input_tokens, globals);
                    }
                }
            }
            "content_block_delta" => {
                #[derive(Default, Deserialize)]
                struct Delta {
                    #[serde(default)]
                    text: String,
                    #[serde(default)]
                    thinking: String,
                    #[serde(default)]
                    partial_json: String,
                }
                #[derive(Deserialize)]
                struct Frame {
                    #[serde(default)]
                    delta: Delta,
                }
                if let Ok(frame) = serde_json::from_str::<Frame>(data) {
                    let d = frame.delta;
                    if !d.text.is_empty() || !d.thinking.is_empty() || !d.partial_json.is_empty() {
                        self.count_output(globals);
                    }
                }
            }
            "message_delta" => {
                #[derive(Deserialize)]
                struct Usage {
                    #[serde(default)]
                    output_tokens: i64,
                }
                #[derive(Deserialize)]
                struct Frame {
                    #[serde(default)]
                    usage: Option<Usage>,
                }
                if let Ok(frame) = serde_json::from_str::<Frame>(data) {
                    if let Some(usage) = frame.usage {
                        self.correct_output(usage.output_tokens, globals);
                    }
                }
            }
            _ => {}
        }
    }

    // OpenAI Responses (/v1/responses): "event:" / "data:" pairs. Text,
    // reasoning-summary, and function-argument deltas count one token each;
    // response.completed carries authoritative input and output totals.
    fn parse_openai_responses_line(
        &self,
        state: &mut LineState,
        line: &str,
        globals: &GlobalCounters,
    ) {
        if let Some(event) = line.strip_prefix("event: ") {
            state.last_event = event.to_string();
            return;
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };

        match state.last_event.as_str() {
            "response.output_text.delta"
            | "response.reasoning_summary_text.delta"
            | "response.function_call_arguments.delta" => {
                #[derive(Deserialize)]
                struct Frame {
                    #[serde(default)]
                    delta: String,
                }
                if let Ok(frame) = serde_json::from_str::<Frame>(data) {
                    if !frame.delta.is_empty() {
                        self.count_output(globals);
                    }
                }
            }
            "response.completed" => {
                #[derive(Deserialize)]
                struct Usage {
                    #[serde(default)]
                    input_tokens: i64,
                    #[serde(default)]
                    output_tokens: i64,
                }
                #[derive(Deserialize)]
                struct Response {
                    #[serde(default)]
                    usage: Option<Usage>,
                }
                #[derive(Deserialize)]
                struct Frame {
                    response: Option<Response>,
                }
                if let Ok(frame) = serde_json::from_str::<Frame>(data) {
                    if let Some(usage) = frame.response.and_then(|r| r.usage) {
                        self.adopt_input(usage.input_tokens, globals);
                        self.correct_output(usage.output_tokens, globals);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(parser: &TokenParser, globals: &GlobalCounters, lines: &[&str]) {
        for line in lines {
            parser.feed(line.as_bytes(), globals);
            parser.feed(b"\n", globals);
        }
    }

    #[test]
    fn style_detection_by_path_prefix() {
        assert_eq!(detect_api_style("/api/generate"), ApiStyle::Ollama);
        assert_eq!(detect_api_style("/api/chat"), ApiStyle::Ollama);
        assert_eq!(
            detect_api_style("/v1/chat/completions"),
            ApiStyle::OpenAiChat
        );
        assert_eq!(detect_api_style("/v1/messages"), ApiStyle::Anthropic);
        assert_eq!(detect_api_style("/v1/responses"), ApiStyle::OpenAiResponses);
        assert_eq!(detect_api_style("/api/tags"), ApiStyle::Unknown);
    }

    #[test]
    fn ollama_counts_chunks_and_adopts_prompt_eval() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/chat");

        feed_lines(
            &parser,
            &globals,
            &[
                r#"{"done":false,"message":{"content":"Hel"}}"#,
                r#"{"done":false,"message":{"content":"lo"}}"#,
                r#"{"done":false,"message":{"content":"!"}}"#,
                r#"{"done":true,"prompt_eval_count":7}"#,
            ],
        );

        assert_eq!(parser.counts(), (7, 3));
        assert_eq!(globals.totals(), (7, 3));
    }

    #[test]
    fn ollama_generate_uses_response_field() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/generate");

        feed_lines(
            &parser,
            &globals,
            &[
                r#"{"done":false,"response":"a"}"#,
                r#"{"done":false,"response":""}"#,
                r#"{"done":true,"prompt_eval_count":2}"#,
            ],
        );

        assert_eq!(parser.counts(), (2, 1));
    }

    #[test]
    fn ollama_prompt_eval_adopted_once() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/chat");

        feed_lines(
            &parser,
            &globals,
            &[
                r#"{"done":true,"prompt_eval_count":5}"#,
                r#"{"done":true,"prompt_eval_count":9}"#,
            ],
        );

        assert_eq!(parser.counts().0, 5);
        assert_eq!(globals.totals().0, 5);
    }

    #[test]
    fn chunks_split_mid_line_are_reassembled() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/generate");

        parser.feed(br#"{"done":false,"re"#, &globals);
        parser.feed(br#"sponse":"hi"}"#, &globals);
        assert_eq!(parser.counts(), (0, 0), "partial line must not count");
        parser.feed(b"\n", &globals);
        assert_eq!(parser.counts(), (0, 1));
    }

    #[test]
    fn crlf_lines_are_stripped() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/generate");
        parser.feed(b"{\"done\":false,\"response\":\"x\"}\r\n", &globals);
        assert_eq!(parser.counts(), (0, 1));
    }

    #[test]
    fn malformed_json_is_skipped() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/generate");
        feed_lines(
            &parser,
            &globals,
            &[
                "this is not json",
                r#"{"done":false,"response":"ok"}"#,
                "{truncated",
            ],
        );
        assert_eq!(parser.counts(), (0, 1));
    }

    #[test]
    fn openai_chat_counts_deltas_and_usage() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/v1/chat/completions");

        feed_lines(
            &parser,
            &globals,
            &[
                r#"data: {"choices":[{"delta":{"content":"He"}}]}"#,
                r#"data: {"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#,
                r#"data: {"choices":[{"delta":{}}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":11}}"#,
                "data: [DONE]",
            ],
        );

        assert_eq!(parser.counts(), (11, 2));
        assert_eq!(globals.totals(), (11, 2));
    }

    #[test]
    fn openai_chat_without_usage_leaves_input_zero() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/v1/chat/completions");
        feed_lines(
            &parser,
            &globals,
            &[r#"data: {"choices":[{"delta":{"content":"x"}}]}"#, "data: [DONE]"],
        );
        assert_eq!(parser.counts(), (0, 1));
    }

    #[test]
    fn anthropic_stream_with_authoritative_correction() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/v1/messages");

        feed_lines(
            &parser,
            &globals,
            &[
                "event: message_start",
                r#"data: {"message":{"usage":{"input_tokens":21}}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"text_delta","text":"Hi"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"thinking_delta","thinking":"..."}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
                "event: message_delta",
                r#"data: {"usage":{"output_tokens":9}}"#,
            ],
        );

        // 3 streamed deltas corrected up to the authoritative 9.
        assert_eq!(parser.counts(), (21, 9));
        assert_eq!(globals.totals(), (21, 9));
        // Streaming-only counter keeps the raw delta count for rates.
        assert_eq!(parser.streamed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn anthropic_empty_delta_does_not_count() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/v1/messages");
        feed_lines(
            &parser,
            &globals,
            &["event: content_block_delta", r#"data: {"delta":{}}"#],
        );
        assert_eq!(parser.counts(), (0, 0));
    }

    #[test]
    fn openai_responses_deltas_and_completed_totals() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/v1/responses");

        feed_lines(
            &parser,
            &globals,
            &[
                "event: response.output_text.delta",
                r#"data: {"delta":"He"}"#,
                "event: response.reasoning_summary_text.delta",
                r#"data: {"delta":"plan"}"#,
                "event: response.function_call_arguments.delta",
                r#"data: {"delta":"{\"x\":1}"}"#,
                "event: response.completed",
                r#"data: {"response":{"usage":{"input_tokens":33,"output_tokens":12}}}"#,
            ],
        );

        assert_eq!(parser.counts(), (33, 12));
        assert_eq!(globals.totals(), (33, 12));
    }

    #[test]
    fn unknown_style_counts_nothing() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/tags");
        parser.feed(b"{\"done\":false,\"response\":\"x\"}\n", &globals);
        assert_eq!(parser.counts(), (0, 0));
        assert_eq!(globals.totals(), (0, 0));
    }

    #[test]
    fn rates_need_anchors_and_more_than_one_token() {
        let globals = GlobalCounters::default();
        let parser = TokenParser::new("/api/generate");

        assert_eq!(parser.live_output_rate(), 0.0);
        assert_eq!(parser.input_rate(), 0.0);

        parser.mark_upstream_start();
        parser.feed(b"{\"done\":false,\"response\":\"a\"}\n", &globals);
        assert_eq!(parser.live_output_rate(), 0.0, "single token has no rate");

        std::thread::sleep(std::time::Duration::from_millis(5));
        parser.feed(b"{\"done\":false,\"response\":\"b\"}\n", &globals);
        assert!(parser.live_output_rate() > 0.0);

        parser.feed(b"{\"done\":true,\"prompt_eval_count\":4}\n", &globals);
        assert!(parser.input_rate() > 0.0);
    }

    #[test]
    fn global_counters_accumulate_across_requests() {
        let globals = GlobalCounters::default();

        let first = TokenParser::new("/api/chat");
        feed_lines(
            &first,
            &globals,
            &[
                r#"{"done":false,"message":{"content":"a"}}"#,
                r#"{"done":true,"prompt_eval_count":2}"#,
            ],
        );

        let second = TokenParser::new("/api/chat");
        feed_lines(
            &second,
            &globals,
            &[
                r#"{"done":false,"message":{"content":"b"}}"#,
                r#"{"done":true,"prompt_eval_count":3}"#,
            ],
        );

        assert_eq!(globals.totals(), (5, 2));
    }
}
