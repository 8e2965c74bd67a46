use std::path::PathBuf;
use tauri::{AppHandle, State};
use tauri_plugin_dialog::DialogExt;

use crate::session::{SessionSnapshot, StoryController};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Event carrying a [`SessionSnapshot`] after every session change.
pub const SESSION_EVENT: &str = "story-session";

/// Open the native file picker and load the chosen image.
///
/// Returns `None` when the dialog is dismissed.
#[tauri::command]
pub async fn pick_image(
    app: AppHandle,
    story: State<'_, StoryController>,
) -> Result<Option<SessionSnapshot>, String> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    app.dialog()
        .file()
        .set_title("Choose a picture")
        .add_filter("Images", &IMAGE_EXTENSIONS)
        .pick_file(move |file| {
            let _ = tx.send(file);
        });

    let Some(file) = rx.await.map_err(|e| format!("File dialog closed unexpectedly: {}", e))? else {
        log::info!("Image selection cancelled");
        return Ok(None);
    };
    let path = file
        .into_path()
        .map_err(|e| format!("Unsupported file location: {}", e))?;

    Ok(Some(story.load_image(&path).await))
}

/// Load an image from a path supplied by the web view (drag and drop).
#[tauri::command]
pub async fn load_image(
    path: String,
    story: State<'_, StoryController>,
) -> Result<SessionSnapshot, String> {
    log::info!("Loading image: {}", path);
    Ok(story.load_image(&PathBuf::from(path)).await)
}

#[tauri::command]
pub async fn generate_story(story: State<'_, StoryController>) -> Result<SessionSnapshot, String> {
    Ok(story.generate_story().await)
}

#[tauri::command]
pub async fn toggle_read_aloud(
    story: State<'_, StoryController>,
) -> Result<SessionSnapshot, String> {
    Ok(story.toggle_read_aloud().await)
}

#[tauri::command]
pub fn stop_read_aloud(story: State<'_, StoryController>) -> SessionSnapshot {
    story.stop_read_aloud()
}

#[tauri::command]
pub fn get_session(story: State<'_, StoryController>) -> SessionSnapshot {
    story.snapshot()
}
