use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    BackendOptions, Fragment, FragmentStream, GenerationRequest, drain_lines, http_client,
    spawn_stream, take_tail,
};
use crate::CoreError;

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const OLLAMA_DEFAULT_MODEL: &str = "codellama:7b";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Local Ollama daemon speaking newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateEvent {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

impl OllamaBackend {
    pub fn new(options: &BackendOptions) -> Result<Self, CoreError> {
        Ok(Self {
            base_url: options
                .ollama_url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            model: options
                .model
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_owned()),
            client: http_client()?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/tags` answered with 200 within two seconds.
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => {
                debug!(status = %resp.status(), "ollama probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                debug!(error = %e, "ollama probe failed");
                false
            }
        }
    }

    pub fn stream(&self, request: GenerationRequest) -> FragmentStream {
        let client = self.client.clone();
        let url = format!("{}/api/generate", self.base_url);
        let model = self.model.clone();

        spawn_stream(move |tx| async move {
            let body = GenerateBody {
                model: &model,
                prompt: request.prompt(),
                temperature: request.temperature(),
                stream: true,
                system: request.system(),
            };
            let response = client
                .post(&url)
                .timeout(request.timeout())
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    warn!(%status, "ollama returned an error status");
                    let _ = tx
                        .send(Fragment::error(format!("API returned status {status}: {}", excerpt(&text))))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "ollama request failed");
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
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: GenerateEvent = match serde_json::from_str(&line) {
                        Ok(ev) => ev,
                        Err(e) => {
                            let _ = tx.send(Fragment::error(e)).await;
                            return;
                        }
                    };
                    if let Some(text) = event.response
                        && tx.send(Fragment::Text(text)).await.is_err()
                    {
                        return;
                    }
                    if event.done {
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

/// First part of an error body, for diagnostics.
pub(crate) fn excerpt(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() > LIMIT {
        format!("{}...", trimmed.chars().take(LIMIT).collect::<String>())
    } else {
        trimmed.to_owned()
    }
}
