use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio_util::{SPEECH_CHANNELS, SPEECH_SAMPLE_RATE};

pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_STORY_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_SPEECH_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

const DEFAULT_STORY_PROMPT: &str = "请仔细分析这张图片的氛围、光影、场景和细节。基于你的分析，请用中文创作一个引人入胜的故事开篇段落。语言要优美、有画面感，能够通过文字传达出图片中的情绪。";

/// Environment variables checked for the API key, in order.
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Application settings, stored as `settings.json` in the app data dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub api_key: String,
    pub api_base_url: String,
    pub story_model: String,
    pub speech_model: String,
    pub voice_name: String,
    pub story_prompt: String,
    pub speech_sample_rate: u32,
    pub speech_channels: u16,
    pub max_image_bytes: u64,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            story_model: DEFAULT_STORY_MODEL.to_string(),
            speech_model: DEFAULT_SPEECH_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            story_prompt: DEFAULT_STORY_PROMPT.to_string(),
            speech_sample_rate: SPEECH_SAMPLE_RATE,
            speech_channels: SPEECH_CHANNELS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            request_timeout_secs: 120,
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file gives the defaults; so does
    /// a file that no longer parses (logged).
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No settings at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("Failed to parse settings, using defaults: {}", e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        log::info!("Settings saved to {:?}", path);
        Ok(())
    }

    /// Apply `GEMINI_API_KEY` / `API_KEY` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|name| std::env::var(name).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let key = API_KEY_VARS
            .iter()
            .filter_map(|name| lookup(*name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty());
        if let Some(key) = key {
            self.api_key = key;
        }
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Copy safe to hand to the web view.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: String::new(),
            ..self.clone()
        }
    }

    /// Merge an edit from the web view. An empty key keeps the current one.
    pub fn merged_with(&self, mut update: Settings) -> Self {
        if update.api_key.trim().is_empty() {
            update.api_key = self.api_key.clone();
        }
        update
    }
}
