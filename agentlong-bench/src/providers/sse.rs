//! Server-sent event handling for streamed chat completions

use futures::{Stream, StreamExt};

use super::traits::{BackendError, BackendResult};

/// One decoded event of an OpenAI-style completion stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Usage { input_tokens: u32, output_tokens: u32 },
    Finish(String),
    Model(String),
    Done,
}

/// Text accumulated from a finished stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedCompletion {
    pub content: String,
    pub model: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: Option<String>,
}

/// Payloads of the `data: ` lines of a response body
///
/// Transport failures mid-body are yielded as `BackendError::Stream` so the
/// caller can retry the whole request.
pub fn sse_data_stream(
    response: reqwest::Response,
) -> impl Stream<Item = BackendResult<String>> + Send {
    data_lines(response.bytes_stream())
}

/// Split a byte stream into `data:` payloads
///
/// Bytes are buffered until a full line arrives, so a multibyte character
/// split across two chunks is decoded whole.
fn data_lines<S, B, E>(chunks: S) -> impl Stream<Item = BackendResult<String>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunks = Box::pin(chunks);

        while let Some(result) = chunks.next().await {
            match result {
                Ok(bytes) => buffer.extend_from_slice(bytes.as_ref()),
                Err(e) => {
                    yield Err(BackendError::Stream(e.to_string()));
                    return;
                }
            }

            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let text = String::from_utf8_lossy(&line[..newline_pos]);
                if let Some(data) = data_payload(text.trim_end_matches('\r')) {
                    yield Ok(data.to_string());
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer);
        if let Some(data) = data_payload(rest.trim_end()) {
            yield Ok(data.to_string());
        }
    }
}

fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Decoded events of a chat completion stream, ending at `[DONE]`
pub fn chat_events(
    data: impl Stream<Item = BackendResult<String>> + Send,
) -> impl Stream<Item = BackendResult<StreamEvent>> + Send {
    async_stream::stream! {
        let mut data = Box::pin(data);

        while let Some(item) = data.next().await {
            let payload = match item {
                Ok(payload) => payload,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if payload == "[DONE]" {
                yield Ok(StreamEvent::Done);
                return;
            }
            for event in parse_chunk(&payload) {
                yield Ok(event);
            }
        }
    }
}

/// Events carried by one `data:` payload; unreadable payloads carry none
pub fn parse_chunk(data: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("Ignoring unreadable stream chunk: {}", data);
            return events;
        }
    };

    if let Some(model) = json["model"].as_str() {
        events.push(StreamEvent::Model(model.to_string()));
    }

    if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
        events.push(StreamEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    if let Some(choices) = json["choices"].as_array() {
        for choice in choices {
            if let Some(text) = choice["delta"]["content"].as_str() {
                if !text.is_empty() {
                    events.push(StreamEvent::Delta(text.to_string()));
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                events.push(StreamEvent::Finish(reason.to_string()));
            }
        }
    }

    events
}

/// Drain an event stream into the full response text
///
/// A stream that stops before `[DONE]` and before any finish reason was
/// cut off, which is reported as a stream error.
pub async fn collect_completion(
    events: impl Stream<Item = BackendResult<StreamEvent>>,
) -> BackendResult<StreamedCompletion> {
    let mut events = Box::pin(events);
    let mut completion = StreamedCompletion::default();
    let mut done = false;

    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Delta(text) => completion.content.push_str(&text),
            StreamEvent::Usage { input_tokens, output_tokens } => {
                completion.input_tokens = input_tokens;
                completion.output_tokens = output_tokens;
            }
            StreamEvent::Finish(reason) => completion.finish_reason = Some(reason),
            StreamEvent::Model(model) => completion.model = Some(model),
            StreamEvent::Done => {
                done = true;
                break;
            }
        }
    }

    if !done && completion.finish_reason.is_none() {
        return Err(BackendError::Stream(
            "stream ended without a finish reason".to_string(),
        ));
    }
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn payloads(items: &[&str]) -> impl Stream<Item = BackendResult<String>> + Send {
        let owned: Vec<BackendResult<String>> = items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(owned)
    }

    #[test]
    fn test_parse_chunk_delta_and_usage() {
        let data = r#"{"model":"m1","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}],"usage":{"prompt_tokens":10,"completion_tokens":2}}"#;
        let events = parse_chunk(data);
        assert!(events.contains(&StreamEvent::Delta("Hel".to_string())));
        assert!(events.contains(&StreamEvent::Usage { input_tokens: 10, output_tokens: 2 }));
        assert!(events.contains(&StreamEvent::Model("m1".to_string())));
        assert!(parse_chunk("not json").is_empty());
    }

    #[tokio::test]
    async fn test_collect_accumulates_fragments() {
        let data = payloads(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"The item appears "}}]}"#,
            r#"{"choices":[{"delta":{"content":"\\boxed{3} times."}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"ignored"}}]}"#,
        ]);
        let completion = collect_completion(chat_events(data)).await.unwrap();
        assert_eq!(completion.content, "The item appears \\boxed{3} times.");
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_cut_off_stream_is_error() {
        let data = payloads(&[r#"{"choices":[{"delta":{"content":"partial"}}]}"#]);
        let err = collect_completion(chat_events(data)).await.unwrap_err();
        assert!(matches!(err, BackendError::Stream(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let items: Vec<BackendResult<String>> = vec![
            Ok(r#"{"choices":[{"delta":{"content":"a"}}]}"#.to_string()),
            Err(BackendError::Stream("connection reset".to_string())),
        ];
        let err = collect_completion(chat_events(stream::iter(items))).await.unwrap_err();
        assert!(matches!(err, BackendError::Stream(ref m) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        let body = "data: Flab\u{e9}b\u{e9}\n\ndata: [DONE]\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            vec![Ok(body[..split].to_vec()), Ok(body[split..].to_vec())];

        let lines: Vec<String> = data_lines(stream::iter(chunks))
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["Flab\u{e9}b\u{e9}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_data_payload_prefix() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: ping"), None);
    }
}
