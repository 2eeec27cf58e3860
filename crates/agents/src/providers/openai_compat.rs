use std::pin::Pin;

use {
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    tokio_stream::Stream,
    tracing::{debug, trace},
};

use crate::model::{LlmProvider, StreamEvent, Usage};

/// Streaming chat completions against an OpenAI-compatible endpoint
/// (OpenAI, DashScope compatible mode, vLLM, Ollama, ...).
pub struct OpenAiCompatProvider {
    model: String,
    base_url: String,
    api_key: Secret<String>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(model: String, base_url: String, api_key: Secret<String>) -> Self {
        Self {
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn request_body(&self, messages: &[serde_json::Value]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

/// What a single `data:` payload means for the stream.
#[derive(Debug, PartialEq)]
enum Chunk {
    Delta(String),
    Usage(Usage),
    Done,
    Error(String),
    Skip,
}

/// Split the next complete line off `buf`, decoded and trimmed.
///
/// Bytes are buffered until a newline arrives, so a multi-byte character
/// split across network chunks is decoded whole.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

fn parse_data(data: &str) -> Chunk {
    if data == "[DONE]" {
        return Chunk::Done;
    }
    let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
        trace!(data, "skipping unparseable stream line");
        return Chunk::Skip;
    };

    if let Some(err) = evt.get("error").filter(|e| !e.is_null()) {
        let msg = err["message"]
            .as_str()
            .or_else(|| err.as_str())
            .unwrap_or("unknown error");
        return Chunk::Error(msg.to_string());
    }

    if let Some(delta) = evt["choices"][0]["delta"]["content"].as_str()
        && !delta.is_empty()
    {
        return Chunk::Delta(delta.to_string());
    }

    if let Some(u) = evt["usage"].as_object() {
        return Chunk::Usage(Usage {
            input_tokens: u
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            output_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        });
    }

    Chunk::Skip
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        Box::pin(async_stream::stream! {
            let body = self.request_body(&messages);

            let resp = match self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await
            {
                Ok(r) => {
                    if let Err(e) = r.error_for_status_ref() {
                        let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                        let body_text = r.text().await.unwrap_or_default();
                        yield StreamEvent::Error(format!("HTTP {status}: {body_text}"));
                        return;
                    }
                    r
                }
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                }
            };

            let mut byte_stream = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            let mut usage = Usage::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(line) = take_line(&mut buf) {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };

                    match parse_data(data.trim_start()) {
                        Chunk::Delta(delta) => yield StreamEvent::Delta(delta),
                        Chunk::Usage(u) => usage = u,
                        Chunk::Done => {
                            debug!(
                                model = %self.model,
                                input_tokens = usage.input_tokens,
                                output_tokens = usage.output_tokens,
                                "completion stream done"
                            );
                            yield StreamEvent::Done(usage);
                            return;
                        }
                        Chunk::Error(msg) => {
                            yield StreamEvent::Error(msg);
                            return;
                        }
                        Chunk::Skip => {}
                    }
                }
            }

            // Some servers close the connection without a `[DONE]` sentinel.
            yield StreamEvent::Done(usage);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base_url: String) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new("qwen-plus".into(), base_url, Secret::new("sk-test".into()))
    }

    fn user(text: &str) -> Vec<serde_json::Value> {
        vec![serde_json::json!({"role": "user", "content": text})]
    }

    #[test]
    fn parse_delta_usage_done_and_error() {
        assert_eq!(
            parse_data(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            Chunk::Delta("Hi".into())
        );
        assert_eq!(
            parse_data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            Chunk::Skip
        );
        assert_eq!(
            parse_data(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#),
            Chunk::Usage(Usage {
                input_tokens: 7,
                output_tokens: 3,
            })
        );
        assert_eq!(parse_data("[DONE]"), Chunk::Done);
        assert_eq!(
            parse_data(r#"{"error":{"message":"quota exceeded"}}"#),
            Chunk::Error("quota exceeded".into())
        );
        assert_eq!(parse_data("not json"), Chunk::Skip);
    }

    #[test]
    fn take_line_waits_for_split_characters() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n".as_bytes();
        let cut = line.iter().position(|&b| b >= 0x80).unwrap() + 1;

        let mut buf = line[..cut].to_vec();
        assert_eq!(take_line(&mut buf), None);
        buf.extend_from_slice(&line[cut..]);
        let decoded = take_line(&mut buf).unwrap();
        assert!(decoded.contains("你好"));
        assert!(!decoded.contains('\u{FFFD}'));
        assert!(buf.is_empty());
    }

    #[test]
    fn request_body_streams_and_sets_temperature() {
        let p = provider("http://localhost/v1/".into()).with_temperature(0.2);
        assert_eq!(p.base_url, "http://localhost/v1");
        let body = p.request_body(&user("hello"));
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "qwen-plus");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body["temperature"].as_f64().is_some());
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let p = provider(server.url());
        let events: Vec<StreamEvent> = p.stream(user("hello")).collect().await;

        mock.assert_async().await;
        assert_eq!(events, vec![
            StreamEvent::Delta("Hi".into()),
            StreamEvent::Delta(" there".into()),
            StreamEvent::Done(Usage {
                input_tokens: 5,
                output_tokens: 2,
            }),
        ]);
    }

    #[tokio::test]
    async fn http_error_becomes_error_event() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let p = provider(server.url());
        let events: Vec<StreamEvent> = p.stream(user("hello")).collect().await;

        assert_eq!(events, vec![StreamEvent::Error(
            "HTTP 401: invalid api key".into()
        )]);
    }

    #[tokio::test]
    async fn multibyte_delta_split_across_chunks() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut scratch = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut scratch).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&scratch[..n]);
            }

            let payload =
                "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n\n";
            let bytes = payload.as_bytes();
            // Cut inside the first byte sequence of `你`.
            let cut = bytes.iter().position(|&b| b >= 0x80).unwrap() + 1;

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for part in [&bytes[..cut], &bytes[cut..]] {
                socket
                    .write_all(format!("{:x}\r\n", part.len()).as_bytes())
                    .await
                    .unwrap();
                socket.write_all(part).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        let p = provider(format!("http://{addr}"));
        let events: Vec<StreamEvent> = p.stream(user("hello")).collect().await;
        server.await.unwrap();

        assert_eq!(events, vec![
            StreamEvent::Delta("你好".into()),
            StreamEvent::Done(Usage::default()),
        ]);
    }

    #[tokio::test]
    async fn missing_done_sentinel_still_finishes() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n")
            .create_async()
            .await;

        let p = provider(server.url());
        let events: Vec<StreamEvent> = p.stream(user("hello")).collect().await;

        assert_eq!(events, vec![
            StreamEvent::Delta("ok".into()),
            StreamEvent::Done(Usage::default()),
        ]);
    }
}
