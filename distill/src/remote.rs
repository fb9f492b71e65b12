//! HTTP adapters for engines served out of process.
//!
//! All endpoints speak JSON. Audio travels as base64 PCM16 mono with an
//! explicit sample rate:
//!
//! | Engine  | Request                  | Body                                          |
//! |---------|--------------------------|-----------------------------------------------|
//! | teacher | `POST {url}/render`      | `{text, style_hint, speaking_rate, source?}`  |
//! | student | `POST {url}/render`      | `{embedding: {shape, data}, text}`            |
//! | student | `GET {url}/voices`       |                                               |
//! | encoder | `POST {url}/encode`      | `{audio, sample_rate}`                        |

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::audio::Waveform;
use crate::embedding::VoiceEmbedding;
use crate::engine::{BaseEmbedding, SpeakerEncoder, StudentEngine, TeacherEngine, VoiceSource, millis};
use crate::error::{DistillError, DistillResult, RenderError, ScoringError};

const AGENT: &str = "voxkit-distill/0.1";

/// One remote engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL. Empty disables the endpoint.
    pub url: String,
    /// Bearer token; `$VAR` or `${VAR}` reads the environment.
    pub api_key: String,
    /// Per-request timeout (default: 60s).
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl EndpointConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Endpoints for every remote engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineEndpoints {
    pub teacher: EndpointConfig,
    pub student: EndpointConfig,
    /// Empty URL selects the built-in statistics-pooling encoder.
    pub encoder: EndpointConfig,
    /// Output dimension of the remote encoder (default: 256).
    pub encoder_dimension: usize,
}

impl Default for EngineEndpoints {
    fn default() -> Self {
        Self {
            teacher: EndpointConfig::default(),
            student: EndpointConfig::default(),
            encoder: EndpointConfig::default(),
            encoder_dimension: 256,
        }
    }
}

/// Expands `$VAR` and `${VAR}`; anything else is returned as is.
pub fn expand_env(s: &str) -> String {
    let name = if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        inner
    } else if let Some(inner) = s.strip_prefix('$') {
        inner
    } else {
        return s.to_string();
    };
    std::env::var(name).unwrap_or_default()
}

#[derive(Serialize)]
struct AudioPayload {
    audio: String,
    sample_rate: u32,
}

impl AudioPayload {
    fn encode(wave: &Waveform) -> Self {
        Self {
            audio: BASE64.encode(wave.to_pcm16()),
            sample_rate: wave.sample_rate(),
        }
    }
}

#[derive(Deserialize)]
struct AudioResponse {
    audio: String,
    sample_rate: u32,
}

impl AudioResponse {
    fn decode(self) -> Result<Waveform, RenderError> {
        let bytes = BASE64
            .decode(self.audio.as_bytes())
            .map_err(|e| RenderError::InvalidAudio(format!("base64: {e}")))?;
        if bytes.is_empty() || self.sample_rate == 0 {
            return Err(RenderError::InvalidAudio("empty audio".into()));
        }
        Ok(Waveform::from_pcm16(&bytes, self.sample_rate))
    }
}

/// Shared JSON transport.
struct HttpEndpoint {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpEndpoint {
    fn new(cfg: &EndpointConfig) -> DistillResult<Self> {
        if !cfg.is_enabled() {
            return Err(DistillError::Config("endpoint url is empty".into()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(AGENT));
        let key = expand_env(&cfg.api_key);
        if !key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| DistillError::Config(format!("api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(cfg.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| DistillError::Remote(e.to_string()))?;
        Ok(Self {
            client,
            url: cfg.url.trim_end_matches('/').to_string(),
            timeout: cfg.timeout,
        })
    }

    async fn post<T, R>(&self, path: &str, body: &T) -> Result<R, RenderError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let req = self.client.post(format!("{}{path}", self.url)).json(body);
        self.send(req).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, RenderError> {
        self.send(self.client.get(format!("{}{path}", self.url))).await
    }

    async fn send<R: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<R, RenderError> {
        let resp = req.send().await.map_err(|e| self.map_err(e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.map_err(e))?;
        if !status.is_success() {
            let msg = format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&body));
            return Err(if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                RenderError::Rejected(msg)
            } else {
                RenderError::Synthesis(msg)
            });
        }
        serde_json::from_slice(&body).map_err(|e| RenderError::InvalidAudio(format!("decode response: {e}")))
    }

    fn map_err(&self, e: reqwest::Error) -> RenderError {
        if e.is_timeout() {
            RenderError::Timeout(self.timeout)
        } else {
            RenderError::Synthesis(e.to_string())
        }
    }
}

/// Teacher served over HTTP.
pub struct HttpTeacher {
    http: HttpEndpoint,
}

impl HttpTeacher {
    pub fn new(cfg: &EndpointConfig) -> DistillResult<Self> {
        Ok(Self {
            http: HttpEndpoint::new(cfg)?,
        })
    }
}

#[derive(Serialize)]
struct TeacherRequest<'a> {
    text: &'a str,
    style_hint: &'a str,
    speaking_rate: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<SourcePayload<'a>>,
}

#[derive(Serialize)]
struct SourcePayload<'a> {
    #[serde(flatten)]
    audio: AudioPayload,
    transcript: &'a str,
}

#[async_trait]
impl TeacherEngine for HttpTeacher {
    async fn render(
        &self,
        text: &str,
        style_hint: &str,
        speaking_rate: f32,
        source: Option<&VoiceSource>,
    ) -> Result<Waveform, RenderError> {
        let req = TeacherRequest {
            text,
            style_hint,
            speaking_rate,
            source: source.map(|s| SourcePayload {
                audio: AudioPayload::encode(&s.audio),
                transcript: &s.transcript,
            }),
        };
        self.http.post::<_, AudioResponse>("/render", &req).await?.decode()
    }
}

/// Student served over HTTP.
pub struct HttpStudent {
    http: HttpEndpoint,
}

impl HttpStudent {
    pub fn new(cfg: &EndpointConfig) -> DistillResult<Self> {
        Ok(Self {
            http: HttpEndpoint::new(cfg)?,
        })
    }
}

#[derive(Serialize)]
struct StudentRequest<'a> {
    embedding: &'a VoiceEmbedding,
    text: &'a str,
}

#[derive(Deserialize)]
struct VoicesResponse {
    voices: Vec<VoiceEntry>,
}

#[derive(Deserialize)]
struct VoiceEntry {
    name: String,
    embedding: VoiceEmbedding,
}

#[async_trait]
impl StudentEngine for HttpStudent {
    async fn render(&self, embedding: &VoiceEmbedding, text: &str) -> Result<Waveform, RenderError> {
        let req = StudentRequest { embedding, text };
        self.http.post::<_, AudioResponse>("/render", &req).await?.decode()
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        let resp: VoicesResponse = self.http.get("/voices").await?;
        Ok(resp
            .voices
            .into_iter()
            .map(|v| BaseEmbedding {
                name: v.name,
                embedding: v.embedding,
            })
            .collect())
    }
}

/// Speaker encoder served over HTTP.
pub struct HttpSpeakerEncoder {
    http: HttpEndpoint,
    dimension: usize,
}

impl HttpSpeakerEncoder {
    pub fn new(cfg: &EndpointConfig, dimension: usize) -> DistillResult<Self> {
        Ok(Self {
            http: HttpEndpoint::new(cfg)?,
            dimension,
        })
    }
}

#[derive(Deserialize)]
struct EncodeResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl SpeakerEncoder for HttpSpeakerEncoder {
    async fn encode(&self, wave: &Waveform) -> Result<Vec<f32>, ScoringError> {
        let resp: EncodeResponse = self
            .http
            .post("/encode", &AudioPayload::encode(wave))
            .await
            .map_err(|e| ScoringError::Extractor(e.to_string()))?;
        if resp.embedding.len() != self.dimension {
            return Err(ScoringError::DimensionMismatch {
                expected: self.dimension,
                got: resp.embedding.len(),
            });
        }
        Ok(resp.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
