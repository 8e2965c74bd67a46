//! Settings commands
//!
//! The API key never leaves the backend: reads return it blanked, and a
//! blank key in an edit keeps the stored one.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tauri::State;

use crate::services::gemini::GeminiClient;
use crate::services::path_service;
use crate::services::settings::Settings;
use crate::session::StoryController;

/// Settings currently in effect.
pub struct SettingsState(pub Mutex<Settings>);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub settings: Settings,
    pub has_api_key: bool,
}

impl SettingsView {
    fn of(settings: &Settings) -> Self {
        Self {
            settings: settings.redacted(),
            has_api_key: settings.has_api_key(),
        }
    }
}

#[tauri::command]
pub fn get_settings(state: State<'_, SettingsState>) -> Result<SettingsView, String> {
    let settings = state.0.lock().map_err(|e| e.to_string())?;
    Ok(SettingsView::of(&settings))
}

/// Persist edited settings and rebuild the Gemini client from them.
#[tauri::command]
pub fn save_settings(
    settings: Settings,
    state: State<'_, SettingsState>,
    story: State<'_, StoryController>,
) -> Result<SettingsView, String> {
    let mut current = state.0.lock().map_err(|e| e.to_string())?;
    let merged = current.merged_with(settings);

    let client = GeminiClient::new(&merged).map_err(|e| e.to_string())?;
    let path = path_service::get_settings_path().map_err(|e| e.to_string())?;
    merged.save(&path).map_err(|e| e.to_string())?;

    story.reconfigure(Arc::new(client), &merged);
    *current = merged;
    Ok(SettingsView::of(&current))
}
