use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ollama::excerpt;
use super::{
    Fragment, FragmentStream, GenerationRequest, drain_lines, http_client, spawn_stream, take_tail,
};
use crate::CoreError;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// A hosted provider speaking the OpenAI chat-completions protocol.
///
/// OpenAI and Groq share this shape and differ only in base URL, default
/// model and key.
#[derive(Clone)]
pub struct HostedBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HostedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl HostedBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: http_client()?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// A configuration check only: available when an API key is present.
    pub fn probe(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn stream(&self, request: GenerationRequest) -> FragmentStream {
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let model = self.model.clone();
        let api_key = self.api_key.clone().unwrap_or_default();

        spawn_stream(move |tx| async move {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = request.system() {
                messages.push(ChatMessage {
                    role: "system",
                    content: system,
                });
            }
            messages.push(ChatMessage {
                role: "user",
                content: request.prompt(),
            });
            let body = ChatBody {
                model: &model,
                messages,
                temperature: request.temperature(),
                stream: true,
            };

            let response = client
                .post(&url)
                .bearer_auth(&api_key)
                .timeout(request.timeout())
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    warn!(%status, %url, "chat completion returned an error status");
                    let _ = tx
                        .send(Fragment::error(format!("API returned status {status}: {}", excerpt(&text))))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, %url, "chat completion request failed");
                    let _ = tx.send(Fragment::error(e)).await;
                    return;
                }
            };

            let mut bytes = response.bytes_stream();
            let mut buffer = Vec::new();
            loop {
                let (lines, ended) = match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        (drain_lines(&mut buffer), false)
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Fragment::error(e)).await;
                        return;
                    }
                    None => (take_tail(&mut buffer).into_iter().collect(), true),
                };

                for line in lines {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        debug!("chat stream finished");
                        return;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    let chunk: ChatChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx.send(Fragment::error(e)).await;
                            return;
                        }
                    };
                    let content = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty());
                    if let Some(text) = content
                        && tx.send(Fragment::Text(text)).await.is_err()
                    {
                        return;
                    }
                }
                if ended {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::backend::test_server::{closed_url, serve};

    fn sse(events: &[&str]) -> String {
        events.iter().map(|e| format!("data: {e}\n\n")).collect()
    }

    #[test]
    fn test_should_be_unavailable_without_key() {
        let b = HostedBackend::new(OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL, None)
            .expect("should build backend");
        assert!(!b.probe());
        let blank = HostedBackend::new(OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL, Some("  ".into()))
            .expect("should build backend");
        assert!(!blank.probe());
    }

    #[test]
    fn test_should_be_available_with_key() {
        let b = HostedBackend::new(GROQ_BASE_URL, GROQ_DEFAULT_MODEL, Some("gsk_test".into()))
            .expect("should build backend");
        assert!(b.probe());
    }

    #[test]
    fn test_should_redact_key_in_debug_output() {
        let b = HostedBackend::new(GROQ_BASE_URL, GROQ_DEFAULT_MODEL, Some("secret".into()))
            .expect("should build backend");
        assert!(!format!("{b:?}").contains("secret"));
    }

    #[tokio::test]
    async fn test_should_stream_delta_content_until_done() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"print("}}]}"#,
            r#"{"choices":[{"delta":{"content":"'hi')"}}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"late"}}]}"#,
        ]);
        let (url, mut rx) = serve(200, "text/event-stream", body).await;
        let b = HostedBackend::new(url, "test-model", Some("k-123".into()))
            .expect("should build backend");

        let request = GenerationRequest::builder()
            .prompt("write code")
            .system("you are helpful")
            .build();
        let fragments: Vec<Fragment> = b.stream(request).collect().await;

        assert_eq!(
            fragments,
            vec![
                Fragment::Text("print(".into()),
                Fragment::Text("'hi')".into())
            ]
        );

        let captured = rx.recv().await.expect("should capture request");
        assert!(captured.request_line.starts_with("POST /chat/completions"));
        assert!(
            captured
                .headers
                .to_lowercase()
                .contains("authorization: bearer k-123")
        );
        let body: serde_json::Value =
            serde_json::from_str(&captured.body).expect("should be json");
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "write code");
    }

    #[tokio::test]
    async fn test_should_keep_final_data_line_without_trailing_newline() {
        let body = format!(
            "{}data: {}",
            sse(&[r#"{"choices":[{"delta":{"content":"a"}}]}"#]),
            r#"{"choices":[{"delta":{"content":"b"}}]}"#
        );
        let (url, _rx) = serve(200, "text/event-stream", body).await;
        let b = HostedBackend::new(url, "m", Some("k".into())).expect("should build backend");

        let fragments: Vec<Fragment> = b
            .stream(GenerationRequest::builder().prompt("p").build())
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![Fragment::Text("a".into()), Fragment::Text("b".into())]
        );
    }

    #[tokio::test]
    async fn test_should_send_only_user_message_without_system() {
        let (url, mut rx) = serve(200, "text/event-stream", sse(&["[DONE]"])).await;
        let b = HostedBackend::new(url, "m", Some("k".into())).expect("should build backend");
        let _: Vec<Fragment> = b
            .stream(GenerationRequest::builder().prompt("p").build())
            .collect()
            .await;

        let captured = rx.recv().await.expect("should capture request");
        let body: serde_json::Value =
            serde_json::from_str(&captured.body).expect("should be json");
        let messages = body["messages"].as_array().expect("should be array");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[tokio::test]
    async fn test_should_yield_diagnostic_on_unauthorized() {
        let (url, _rx) = serve(401, "application/json", r#"{"error":"bad key"}"#.into()).await;
        let b = HostedBackend::new(url, "m", Some("k".into())).expect("should build backend");
        let fragments: Vec<Fragment> = b
            .stream(GenerationRequest::builder().prompt("p").build())
            .collect()
            .await;

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_diagnostic());
        assert!(fragments[0].as_str().contains("401"));
    }

    #[tokio::test]
    async fn test_should_yield_diagnostic_when_unreachable() {
        let url = closed_url().await;
        let b = HostedBackend::new(url, "m", Some("k".into())).expect("should build backend");
        let fragments: Vec<Fragment> = b
            .stream(GenerationRequest::builder().prompt("p").build())
            .collect()
            .await;

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_diagnostic());
    }
}
