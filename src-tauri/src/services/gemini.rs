//! Gemini REST client.
//!
//! Two single-shot `generateContent` calls: image → story text, and
//! text → base64 speech audio (16-bit PCM, mono, 24 kHz). No streaming and
//! no retries; the caller decides what to do with a failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::settings::Settings;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("No API key configured")]
    MissingApiKey,
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Quota exceeded: {0}")]
    Quota(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Model returned an empty response")]
    EmptyResponse,
    #[error("No audio data received from Gemini")]
    MissingAudio,
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The two remote operations the story session depends on.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Write a story opening for an image (base64 body + MIME type).
    async fn describe_image(
        &self,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<String, GenerationError>;

    /// Read `text` aloud. Returns the base64 PCM payload.
    async fn synthesize_speech(&self, text: &str) -> Result<String, GenerationError>;
}

// ── Wire types ──

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestPart<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: Vec<&'a str>,
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<ResponseInlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseInlineData {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn story_request<'a>(image_base64: &'a str, mime_type: &'a str, prompt: &'a str) -> GenerateContentRequest<'a> {
    GenerateContentRequest {
        contents: vec![Content {
            parts: vec![
                RequestPart {
                    inline_data: Some(InlineData { mime_type, data: image_base64 }),
                    text: None,
                },
                RequestPart { inline_data: None, text: Some(prompt) },
            ],
        }],
        generation_config: None,
    }
}

fn speech_request<'a>(text: &'a str, voice_name: &'a str) -> GenerateContentRequest<'a> {
    GenerateContentRequest {
        contents: vec![Content {
            parts: vec![RequestPart { inline_data: None, text: Some(text) }],
        }],
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
                },
            },
        }),
    }
}

fn first_parts(response: &GenerateContentResponse) -> &[ResponsePart] {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|c| c.parts.as_slice())
        .unwrap_or(&[])
}

/// All text parts of the first candidate, joined.
fn extract_text(response: &GenerateContentResponse) -> Result<String, GenerationError> {
    let text: String = first_parts(response)
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(text)
}

fn extract_audio(response: &GenerateContentResponse) -> Result<String, GenerationError> {
    if response.candidates.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    first_parts(response)
        .iter()
        .filter_map(|p| p.inline_data.as_ref())
        .filter_map(|d| d.data.clone())
        .find(|d| !d.is_empty())
        .ok_or(GenerationError::MissingAudio)
}

/// Turn a non-success HTTP reply into an error.
fn classify_failure(status: u16, body: &str) -> GenerationError {
    let (message, api_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.message, envelope.error.status),
        Err(_) => (body.trim().to_string(), String::new()),
    };
    if status == 429 || api_status == "RESOURCE_EXHAUSTED" {
        GenerationError::Quota(message)
    } else {
        GenerationError::Api { status, message }
    }
}

// ── GeminiClient ──

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    story_model: String,
    speech_model: String,
    voice_name: String,
    story_prompt: String,
}

impl GeminiClient {
    pub fn new(settings: &Settings) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.trim().to_string(),
            story_model: settings.story_model.clone(),
            speech_model: settings.speech_model.clone(),
            voice_name: settings.voice_name.clone(),
            story_prompt: settings.story_prompt.clone(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest<'_>,
    ) -> Result<GenerateContentResponse, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn describe_image(
        &self,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<String, GenerationError> {
        log::info!("Requesting story from {} ({})", self.story_model, mime_type);
        let request = story_request(image_base64, mime_type, &self.story_prompt);
        let response = self.generate(&self.story_model, &request).await?;
        let text = extract_text(&response)?;
        log::info!("Story received: {} chars", text.chars().count());
        Ok(text)
    }

    async fn synthesize_speech(&self, text: &str) -> Result<String, GenerationError> {
        log::info!(
            "Requesting speech from {} (voice {}, {} chars)",
            self.speech_model,
            self.voice_name,
            text.chars().count()
        );
        let request = speech_request(text, &self.voice_name);
        let response = self.generate(&self.speech_model, &request).await?;
        let audio = extract_audio(&response)?;
        log::info!("Speech received: {} base64 chars", audio.len());
        Ok(audio)
    }
}
