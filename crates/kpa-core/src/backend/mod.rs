//! Streaming text generation behind one closed set of providers.
//!
//! Every provider honours the same contract: [`Backend::probe`] never fails
//! (any problem reads as "unavailable") and [`Backend::stream`] always yields
//! a finite sequence of [`Fragment`]s. Transport problems arrive as
//! [`Fragment::Diagnostic`] items instead of errors, so callers decide whether
//! to show them inline or treat them as failures.

mod hosted;
mod ollama;
mod selector;

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

pub use hosted::{GROQ_BASE_URL, GROQ_DEFAULT_MODEL, HostedBackend, OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL};
pub use ollama::{OLLAMA_BASE_URL, OLLAMA_DEFAULT_MODEL, OllamaBackend};
pub use selector::{AUTO_ORDER, BackendKind, select};

use crate::CoreError;

/// Default transport timeout for one generation request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Fragments buffered between the HTTP reader task and the consumer.
const CHANNEL_CAPACITY: usize = 64;

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Model output.
    Text(String),
    /// Transport or provider failure rendered for the user.
    Diagnostic(String),
}

impl Fragment {
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Self::Diagnostic(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Diagnostic(s) => s,
        }
    }

    /// Diagnostic in the inline form printed alongside model output.
    pub(crate) fn error(err: impl std::fmt::Display) -> Self {
        Self::Diagnostic(format!("\n[Error: {err}]"))
    }
}

/// A finite, non-restartable sequence of fragments.
pub type FragmentStream = BoxStream<'static, Fragment>;

/// Parameters of a single generation call.
#[derive(Debug, Clone, TypedBuilder)]
pub struct GenerationRequest {
    #[builder(setter(into))]
    prompt: String,

    #[builder(default, setter(strip_option, into))]
    system: Option<String>,

    #[builder(default = 0.7, setter(transform = |t: f32| t.clamp(0.0, 1.0)))]
    temperature: f32,

    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
}

impl GenerationRequest {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Construction options shared by all providers.
///
/// Unset values fall back to each provider's own default. API keys are passed
/// in explicitly; reading the environment is the caller's job.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct BackendOptions {
    #[builder(default, setter(strip_option, into))]
    pub model: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub ollama_url: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub openai_api_key: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub openai_base_url: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub groq_api_key: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub groq_base_url: Option<String>,
}

impl BackendOptions {
    /// Options with API keys taken from `OPENAI_API_KEY` and `GROQ_API_KEY`.
    pub fn from_env() -> Self {
        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            groq_api_key: non_empty_env("GROQ_API_KEY"),
            ..Self::default()
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// A constructed generation provider.
#[derive(Debug, Clone)]
pub enum Backend {
    Ollama(OllamaBackend),
    OpenAi(HostedBackend),
    Groq(HostedBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Ollama(_) => BackendKind::Ollama,
            Self::OpenAi(_) => BackendKind::OpenAi,
            Self::Groq(_) => BackendKind::Groq,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Ollama(b) => b.model(),
            Self::OpenAi(b) | Self::Groq(b) => b.model(),
        }
    }

    /// Whether the provider can serve requests right now. Never fails.
    pub async fn probe(&self) -> bool {
        match self {
            Self::Ollama(b) => b.probe().await,
            Self::OpenAi(b) | Self::Groq(b) => b.probe(),
        }
    }

    /// Start a generation call. Must be called inside a tokio runtime.
    pub fn stream(&self, request: GenerationRequest) -> FragmentStream {
        match self {
            Self::Ollama(b) => b.stream(request),
            Self::OpenAi(b) | Self::Groq(b) => b.stream(request),
        }
    }
}

/// Build a fresh HTTP client, mapping failures to a configuration error.
pub(crate) fn http_client() -> Result<reqwest::Client, CoreError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| CoreError::Configuration(format!("cannot build http client: {e}")))
}

/// Run `producer` on its own task and expose what it sends as a stream.
///
/// The producer stops as soon as the consumer drops the stream, because its
/// next send fails.
pub(crate) fn spawn_stream<F, Fut>(producer: F) -> FragmentStream
where
    F: FnOnce(mpsc::Sender<Fragment>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(producer(tx));
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|fragment| (fragment, rx))
    })
    .boxed()
}

/// Split complete lines off the front of `buffer`, leaving any partial tail.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        lines.push(line.trim_end_matches('\r').to_owned());
    }
    lines
}

/// The unterminated tail left in `buffer` once the body has ended.
pub(crate) fn take_tail(buffer: &mut Vec<u8>) -> Option<String> {
    let tail = String::from_utf8_lossy(buffer)
        .trim_end_matches('\r')
        .to_owned();
    buffer.clear();
    (!tail.trim().is_empty()).then_some(tail)
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 server answering every request with one canned reply.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A captured request: request line plus body.
    #[derive(Debug, Clone)]
    pub struct Captured {
        pub request_line: String,
        pub headers: String,
        pub body: String,
    }

    /// Serve `status` and `body` for every connection. Returns the base URL and
    /// a receiver of captured requests.
    pub async fn serve(
        status: u16,
        content_type: &'static str,
        body: String,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind listener");
        let addr = listener.local_addr().expect("should have addr");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let captured = read_request(&mut socket).await;
                    let _ = tx.send(captured);
                    let response = format!(
                        "HTTP/1.1 {status} OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> Captured {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = find_header_end(&data) {
                let head = String::from_utf8_lossy(&data[..end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while data.len() < end + 4 + length {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                }
                let body = String::from_utf8_lossy(&data[end + 4..]).to_string();
                let mut lines = head.lines();
                let request_line = lines.next().unwrap_or_default().to_owned();
                let headers = lines.collect::<Vec<_>>().join("\n");
                return Captured {
                    request_line,
                    headers,
                    body,
                };
            }
        }
        Captured {
            request_line: String::new(),
            headers: String::new(),
            body: String::new(),
        }
    }

    fn find_header_end(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// A base URL nothing listens on.
    pub async fn closed_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind listener");
        let addr = listener.local_addr().expect("should have addr");
        drop(listener);
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_clamp_temperature() {
        let hot = GenerationRequest::builder().prompt("p").temperature(3.5).build();
        let cold = GenerationRequest::builder().prompt("p").temperature(-1.0).build();
        assert_eq!(hot.temperature(), 1.0);
        assert_eq!(cold.temperature(), 0.0);
    }

    #[test]
    fn test_should_default_request_fields() {
        let req = GenerationRequest::builder().prompt("hello").build();
        assert_eq!(req.prompt(), "hello");
        assert_eq!(req.system(), None);
        assert_eq!(req.temperature(), 0.7);
        assert_eq!(req.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_should_drain_complete_lines_only() {
        let mut buffer = b"one\r\ntwo\nthr".to_vec();
        assert_eq!(drain_lines(&mut buffer), vec!["one", "two"]);
        assert_eq!(buffer, b"thr");
    }

    #[test]
    fn test_should_take_unterminated_tail_once() {
        let mut buffer = b"{\"done\":true}\r".to_vec();
        assert_eq!(take_tail(&mut buffer).as_deref(), Some("{\"done\":true}"));
        assert!(buffer.is_empty());
        assert_eq!(take_tail(&mut buffer), None);

        let mut blank = b"  \r".to_vec();
        assert_eq!(take_tail(&mut blank), None);
    }

    #[test]
    fn test_should_format_error_fragment() {
        let fragment = Fragment::error("boom");
        assert!(fragment.is_diagnostic());
        assert_eq!(fragment.as_str(), "\n[Error: boom]");
    }

    #[tokio::test]
    async fn test_should_stop_stream_when_producer_finishes() {
        let stream = spawn_stream(|tx| async move {
            let _ = tx.send(Fragment::Text("a".into())).await;
            let _ = tx.send(Fragment::Text("b".into())).await;
        });
        let items: Vec<Fragment> = stream.collect().await;
        assert_eq!(items, vec![Fragment::Text("a".into()), Fragment::Text("b".into())]);
    }
}
