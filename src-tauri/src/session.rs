//! Story session: the image, the generated story and the read-aloud state.
//!
//! All state lives behind one mutex that is never held across an `.await`
//! or while calling into the playback controller. Every change is published
//! to the observer as a [`SessionSnapshot`] once the lock is released.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::audio_util::{decode_base64_pcm16, AudioSampleBuffer, PcmError};
use crate::commands::playback::error::PlaybackError;
use crate::commands::playback::{PlaybackController, PlaybackHandle};
use crate::services::gemini::{GenerationClient, GenerationError};
use crate::services::image_input::{self, ImagePayload, InputError};
use crate::services::settings::Settings;

pub const IMAGE_UNREADABLE: &str = "无法读取图片 (Failed to read image)";
pub const STORY_FAILED: &str = "无法生成故事，请检查网络或稍后重试。(Failed to generate story)";
pub const SPEECH_FAILED: &str = "语音合成失败 (TTS Failed)";

const MIB: u64 = 1024 * 1024;

/// Rejection message for an image over `limit` bytes.
pub fn image_too_large(limit: u64) -> String {
    let size = if limit % MIB == 0 {
        format!("{}MB", limit / MIB)
    } else {
        format!("{:.1}MB", limit as f64 / MIB as f64)
    };
    format!("图片大小不能超过 {size} (Image must be under {size})")
}

/// Anything that can go wrong between "read aloud" and the first sample.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Pcm(#[from] PcmError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Idle,
    Loading,
    Playing,
    Error,
}

#[derive(Debug)]
enum AudioState {
    Idle,
    Loading { request: u64 },
    Playing(PlaybackHandle),
    Error(String),
}

impl AudioState {
    fn status(&self) -> GenerationStatus {
        match self {
            AudioState::Idle => GenerationStatus::Idle,
            AudioState::Loading { .. } => GenerationStatus::Loading,
            AudioState::Playing(_) => GenerationStatus::Playing,
            AudioState::Error(_) => GenerationStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StoryState {
    Empty,
    Generating { epoch: u64 },
    Ready(String),
    Failed(String),
}

/// Serializable view of the session for the web view.
///
/// `image` carries the data URL only when the image changed (and in direct
/// reads); other updates leave it null and the view keeps what it has for
/// `image_epoch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub image: Option<String>,
    pub has_image: bool,
    pub image_epoch: u64,
    pub file_name: Option<String>,
    pub story: String,
    pub is_generating_story: bool,
    pub audio_status: GenerationStatus,
    pub error: Option<String>,
    pub can_read_aloud: bool,
}

struct StorySession {
    image: Option<ImagePayload>,
    story: StoryState,
    audio: AudioState,
    error: Option<String>,
    /// Bumped on every new image; story replies for older epochs are dropped.
    image_epoch: u64,
    /// Bumped on every read-aloud, stop and new image.
    speech_request: u64,
}

impl StorySession {
    fn new() -> Self {
        Self {
            image: None,
            story: StoryState::Empty,
            audio: AudioState::Idle,
            error: None,
            image_epoch: 0,
            speech_request: 0,
        }
    }

    fn story_text(&self) -> Option<&str> {
        match &self.story {
            StoryState::Ready(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    /// Invalidate pending speech and hand back the playing handle, if any.
    fn take_playback(&mut self) -> Option<PlaybackHandle> {
        self.speech_request += 1;
        match std::mem::replace(&mut self.audio, AudioState::Idle) {
            AudioState::Playing(handle) => Some(handle),
            _ => None,
        }
    }

    fn is_current_speech(&self, request: u64) -> bool {
        self.speech_request == request
            && matches!(self.audio, AudioState::Loading { request: r } if r == request)
    }

    fn snapshot(&self, with_image: bool) -> SessionSnapshot {
        let status = self.audio.status();
        SessionSnapshot {
            image: self
                .image
                .as_ref()
                .filter(|_| with_image)
                .map(ImagePayload::data_url),
            has_image: self.image.is_some(),
            image_epoch: self.image_epoch,
            file_name: self.image.as_ref().map(|i| i.file_name.clone()),
            story: self.story_text().unwrap_or_default().to_string(),
            is_generating_story: matches!(self.story, StoryState::Generating { .. }),
            audio_status: status,
            error: self.error.clone(),
            can_read_aloud: self.story_text().is_some() && status != GenerationStatus::Loading,
        }
    }
}

pub type SessionObserver = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Shared {
    state: Mutex<StorySession>,
    observer: SessionObserver,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StorySession> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate the session, then publish the result outside the lock.
    fn update<R>(&self, f: impl FnOnce(&mut StorySession) -> R) -> (R, SessionSnapshot) {
        let (result, snapshot) = {
            let mut session = self.lock();
            let epoch = session.image_epoch;
            let result = f(&mut session);
            let image_changed = session.image_epoch != epoch;
            (result, session.snapshot(image_changed))
        };
        (self.observer)(&snapshot);
        (result, snapshot)
    }

    fn publish(&self) -> SessionSnapshot {
        self.update(|_| ()).1
    }
}

/// Limits and PCM format taken from [`Settings`].
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_image_bytes: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_image_bytes: settings.max_image_bytes,
            sample_rate: settings.speech_sample_rate,
            channels: settings.speech_channels,
        }
    }
}

enum ReadAloud {
    Ignore,
    Stop(PlaybackHandle),
    Speak { text: String, request: u64 },
}

pub struct StoryController {
    shared: Arc<Shared>,
    client: RwLock<Arc<dyn GenerationClient>>,
    playback: Arc<PlaybackController>,
    config: RwLock<SessionConfig>,
}

impl StoryController {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        playback: Arc<PlaybackController>,
        settings: &Settings,
        observer: SessionObserver,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StorySession::new()),
                observer,
            }),
            client: RwLock::new(client),
            playback,
            config: RwLock::new(SessionConfig::from(settings)),
        }
    }

    fn client(&self) -> Arc<dyn GenerationClient> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn config(&self) -> SessionConfig {
        *self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in a client and limits built from edited settings.
    pub fn reconfigure(&self, client: Arc<dyn GenerationClient>, settings: &Settings) {
        *self.client.write().unwrap_or_else(|p| p.into_inner()) = client;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = SessionConfig::from(settings);
        log::info!("Story session reconfigured");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot(true)
    }

    /// Replace the current image and start a story for it.
    pub async fn load_image(&self, path: &Path) -> SessionSnapshot {
        let limit = self.config().max_image_bytes;
        let image = match image_input::load_image(path, limit).await {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Rejected image {:?}: {}", path, e);
                let message = match e {
                    InputError::TooLarge { limit, .. } => image_too_large(limit),
                    InputError::Io(_) => IMAGE_UNREADABLE.to_string(),
                };
                return self.shared.update(|s| s.error = Some(message)).1;
            }
        };

        let (previous, _) = self.shared.update(|s| {
            s.image = Some(image);
            s.story = StoryState::Empty;
            s.error = None;
            s.image_epoch += 1;
            s.take_playback()
        });
        if let Some(handle) = previous {
            self.playback.stop(&handle);
        }

        self.generate_story().await
    }

    /// Ask for a story for the current image. Reading aloud stops first.
    pub async fn generate_story(&self) -> SessionSnapshot {
        let (request, previous) = {
            let mut session = self.shared.lock();
            let generating = matches!(session.story, StoryState::Generating { .. });
            let image = match &session.image {
                Some(image) if !generating => Some((image.base64.clone(), image.mime)),
                _ => None,
            };
            match image {
                Some((base64, mime)) => {
                    let epoch = session.image_epoch;
                    session.story = StoryState::Generating { epoch };
                    session.error = None;
                    (Some((base64, mime, epoch)), session.take_playback())
                }
                None => (None, None),
            }
        };
        let Some((base64, mime, epoch)) = request else {
            return self.snapshot();
        };
        if let Some(handle) = previous {
            self.playback.stop(&handle);
        }
        self.shared.publish();

        let result = self.client().describe_image(&base64, mime.as_str()).await;

        self.shared
            .update(|s| {
                let current = matches!(s.story, StoryState::Generating { epoch: e } if e == epoch);
                if s.image_epoch != epoch || !current {
                    log::warn!("Discarding story for replaced image (epoch {})", epoch);
                    return;
                }
                match result {
                    Ok(text) => s.story = StoryState::Ready(text),
                    Err(e) => {
                        log::error!("Story generation failed: {}", e);
                        s.story = StoryState::Failed(STORY_FAILED.to_string());
                        s.error = Some(STORY_FAILED.to_string());
                    }
                }
            })
            .1
    }

    /// Start reading the story aloud, or stop if it is already playing.
    pub async fn toggle_read_aloud(&self) -> SessionSnapshot {
        let step = {
            let mut session = self.shared.lock();
            match session.audio.status() {
                GenerationStatus::Playing => match session.take_playback() {
                    Some(handle) => ReadAloud::Stop(handle),
                    None => ReadAloud::Ignore,
                },
                GenerationStatus::Loading => ReadAloud::Ignore,
                GenerationStatus::Idle | GenerationStatus::Error => {
                    match session.story_text().map(str::to_owned) {
                        Some(text) => {
                            session.speech_request += 1;
                            let request = session.speech_request;
                            session.audio = AudioState::Loading { request };
                            ReadAloud::Speak { text, request }
                        }
                        None => ReadAloud::Ignore,
                    }
                }
            }
        };

        match step {
            ReadAloud::Ignore => self.snapshot(),
            ReadAloud::Stop(handle) => {
                self.playback.stop(&handle);
                self.shared.publish()
            }
            ReadAloud::Speak { text, request } => {
                self.shared.publish();
                self.speak(text, request).await
            }
        }
    }

    /// Stop reading aloud. Pending speech will not start.
    pub fn stop_read_aloud(&self) -> SessionSnapshot {
        let (handle, snapshot) = self.shared.update(|s| s.take_playback());
        if let Some(handle) = handle {
            self.playback.stop(&handle);
        }
        snapshot
    }

    /// Stop playback and release the output device.
    pub fn shutdown(&self) {
        let handle = self.shared.lock().take_playback();
        if let Some(handle) = handle {
            self.playback.stop(&handle);
        }
        self.playback.close();
        log::info!("Story session shut down");
    }

    async fn synthesize(&self, text: &str) -> Result<AudioSampleBuffer, SpeechError> {
        let config = self.config();
        let playback = self.playback.clone();
        tokio::task::spawn_blocking(move || playback.prepare())
            .await
            .map_err(|e| PlaybackError::Worker(e.to_string()))??;
        let payload = self.client().synthesize_speech(text).await?;
        Ok(decode_base64_pcm16(&payload, config.sample_rate, config.channels)?)
    }

    async fn speak(&self, text: String, request: u64) -> SessionSnapshot {
        let buffer = match self.synthesize(&text).await {
            Ok(buffer) => buffer,
            Err(e) => return self.fail_speech(request, e),
        };

        if !self.shared.lock().is_current_speech(request) {
            log::warn!("Discarding speech for superseded request {}", request);
            return self.snapshot();
        }

        let shared = Arc::downgrade(&self.shared);
        let on_complete = move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.update(|s| {
                if s.speech_request == request && matches!(s.audio, AudioState::Playing(_)) {
                    s.audio = AudioState::Idle;
                }
            });
        };
        // Opening the stream resamples the whole buffer on the device thread
        let playback = self.playback.clone();
        let started = tokio::task::spawn_blocking(move || playback.play(Arc::new(buffer), on_complete))
            .await
            .map_err(|e| PlaybackError::Worker(e.to_string()))
            .and_then(|result| result);
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => return self.fail_speech(request, e.into()),
        };

        let (stale, snapshot) = self.shared.update(|s| {
            if !s.is_current_speech(request) {
                return Some(handle);
            }
            s.error = None;
            if handle.is_active() {
                s.audio = AudioState::Playing(handle);
            } else {
                // Finished before we got here
                s.audio = AudioState::Idle;
            }
            None
        });
        if let Some(handle) = stale {
            log::warn!("Speech request {} superseded during start", request);
            self.playback.stop(&handle);
        }
        snapshot
    }

    fn fail_speech(&self, request: u64, error: SpeechError) -> SessionSnapshot {
        log::error!("Read aloud failed: {}", error);
        self.shared
            .update(|s| {
                if s.is_current_speech(request) {
                    s.audio = AudioState::Error(SPEECH_FAILED.to_string());
                    s.error = Some(SPEECH_FAILED.to_string());
                }
            })
            .1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::playback::test_support::FakeBackend;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::oneshot;

    struct Reply {
        gate: Option<oneshot::Receiver<()>>,
        result: Result<String, GenerationError>,
    }

    #[derive(Default)]
    struct FakeClient {
        stories: Mutex<VecDeque<Reply>>,
        speech: Mutex<VecDeque<Reply>>,
        described: Mutex<Vec<(String, String)>>,
        spoken: Mutex<Vec<String>>,
    }

    impl FakeClient {
        fn story(&self, result: Result<String, GenerationError>) {
            self.stories.lock().unwrap().push_back(Reply { gate: None, result });
        }

        fn gated_story(&self, text: &str) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.stories.lock().unwrap().push_back(Reply {
                gate: Some(rx),
                result: Ok(text.to_string()),
            });
            tx
        }

        fn speech(&self, result: Result<String, GenerationError>) {
            self.speech.lock().unwrap().push_back(Reply { gate: None, result });
        }

        fn gated_speech(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.speech.lock().unwrap().push_back(Reply {
                gate: Some(rx),
                result: Ok(pcm_payload()),
            });
            tx
        }

        fn describe_calls(&self) -> usize {
            self.described.lock().unwrap().len()
        }

        fn speech_calls(&self) -> usize {
            self.spoken.lock().unwrap().len()
        }
    }

    async fn answer(queue: &Mutex<VecDeque<Reply>>) -> Result<String, GenerationError> {
        let reply = queue.lock().unwrap().pop_front();
        let Some(reply) = reply else {
            return Err(GenerationError::EmptyResponse);
        };
        if let Some(gate) = reply.gate {
            let _ = gate.await;
        }
        reply.result
    }

    #[async_trait]
    impl GenerationClient for FakeClient {
        async fn describe_image(
            &self,
            image_base64: &str,
            mime_type: &str,
        ) -> Result<String, GenerationError> {
            self.described
                .lock()
                .unwrap()
                .push((image_base64.to_string(), mime_type.to_string()));
            answer(&self.stories).await
        }

        async fn synthesize_speech(&self, text: &str) -> Result<String, GenerationError> {
            self.spoken.lock().unwrap().push(text.to_string());
            answer(&self.speech).await
        }
    }

    /// 0.1 s of silence at 24 kHz mono.
    fn pcm_payload() -> String {
        STANDARD.encode(vec![0u8; 4800])
    }

    struct Fixture {
        controller: Arc<StoryController>,
        client: Arc<FakeClient>,
        backend: FakeBackend,
        published: Arc<Mutex<Vec<SessionSnapshot>>>,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let client = Arc::new(FakeClient::default());
            let backend = FakeBackend::default();
            let playback = Arc::new(PlaybackController::new(Arc::new(backend.clone())));
            let published = Arc::new(Mutex::new(Vec::new()));
            let sink = published.clone();
            let observer: SessionObserver = Arc::new(move |snapshot: &SessionSnapshot| {
                sink.lock().unwrap().push(snapshot.clone());
            });
            let controller = Arc::new(StoryController::new(
                client.clone(),
                playback,
                &Settings::default(),
                observer,
            ));
            Self {
                controller,
                client,
                backend,
                published,
                dir: tempdir().unwrap(),
            }
        }

        fn image(&self, name: &str, len: usize) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, vec![0xd8u8; len]).unwrap();
            path
        }

        async fn with_story(&self, text: &str) -> SessionSnapshot {
            self.client.story(Ok(text.to_string()));
            let path = self.image("story.jpg", 64);
            self.controller.load_image(&path).await
        }

        fn statuses(&self) -> Vec<GenerationStatus> {
            let mut statuses: Vec<GenerationStatus> = Vec::new();
            for snapshot in self.published.lock().unwrap().iter() {
                if statuses.last() != Some(&snapshot.audio_status) {
                    statuses.push(snapshot.audio_status);
                }
            }
            statuses
        }

        fn last_published(&self) -> SessionSnapshot {
            self.published.lock().unwrap().last().cloned().unwrap()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn oversized_image_is_rejected_locally() {
        let fx = Fixture::new();
        let path = fx.image("huge.jpg", 6 * 1024 * 1024);

        let snapshot = fx.controller.load_image(&path).await;
        assert_eq!(
            snapshot.error.as_deref(),
            Some("图片大小不能超过 5MB (Image must be under 5MB)")
        );
        assert!(snapshot.image.is_none());
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
        assert!(!snapshot.is_generating_story);
        assert_eq!(fx.client.describe_calls(), 0);
    }

    #[tokio::test]
    async fn rejected_image_keeps_current_story() {
        let fx = Fixture::new();
        fx.with_story("夜色渐浓。").await;

        let snapshot = fx.controller.load_image(&fx.image("huge.png", 6 * 1024 * 1024)).await;
        assert_eq!(snapshot.story, "夜色渐浓。");
        assert_eq!(snapshot.error, Some(image_too_large(5 * 1024 * 1024)));
        assert_eq!(fx.client.describe_calls(), 1);
    }

    #[tokio::test]
    async fn loaded_image_is_described() {
        let fx = Fixture::new();
        let path = fx.image("photo.jpg", 2 * 1024 * 1024);
        fx.client.story(Ok("The harbour slept under fog.".into()));

        let snapshot = fx.controller.load_image(&path).await;
        assert_eq!(snapshot.story, "The harbour slept under fog.");
        assert!(snapshot.error.is_none());
        assert!(!snapshot.is_generating_story);
        assert!(snapshot.can_read_aloud);
        assert_eq!(snapshot.file_name.as_deref(), Some("photo.jpg"));
        assert!(snapshot.has_image);
        assert!(fx
            .controller
            .snapshot()
            .image
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));

        let described = fx.client.described.lock().unwrap();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].0, STANDARD.encode(fs::read(&path).unwrap()));
        assert_eq!(described[0].1, "image/jpeg");

        assert!(fx.published.lock().unwrap().iter().any(|s| s.is_generating_story));
    }

    #[tokio::test]
    async fn story_failure_leaves_story_empty() {
        let fx = Fixture::new();
        fx.client.story(Err(GenerationError::Quota("exhausted".into())));

        let snapshot = fx.controller.load_image(&fx.image("a.png", 128)).await;
        assert_eq!(snapshot.story, "");
        assert_eq!(snapshot.error.as_deref(), Some(STORY_FAILED));
        assert!(!snapshot.can_read_aloud);
        assert!(!snapshot.is_generating_story);
    }

    #[tokio::test]
    async fn generate_story_without_image_does_nothing() {
        let fx = Fixture::new();
        let snapshot = fx.controller.generate_story().await;
        assert_eq!(snapshot.story, "");
        assert_eq!(fx.client.describe_calls(), 0);
        assert!(fx.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn regenerating_replaces_the_story() {
        let fx = Fixture::new();
        fx.with_story("first").await;
        fx.client.story(Ok("second".into()));

        let snapshot = fx.controller.generate_story().await;
        assert_eq!(snapshot.story, "second");
        assert_eq!(fx.client.describe_calls(), 2);
    }

    #[tokio::test]
    async fn story_for_replaced_image_is_discarded() {
        let fx = Fixture::new();
        let first = fx.image("first.jpg", 64);
        let second = fx.image("second.png", 64);
        let release = fx.client.gated_story("stale story");
        fx.client.story(Ok("fresh story".into()));

        let controller = fx.controller.clone();
        let pending = tokio::spawn(async move { controller.load_image(&first).await });
        let client = fx.client.clone();
        wait_until(|| client.describe_calls() == 1).await;

        let snapshot = fx.controller.load_image(&second).await;
        assert_eq!(snapshot.story, "fresh story");

        release.send(()).unwrap();
        pending.await.unwrap();
        let snapshot = fx.controller.snapshot();
        assert_eq!(snapshot.story, "fresh story");
        assert_eq!(snapshot.file_name.as_deref(), Some("second.png"));
    }

    #[tokio::test]
    async fn read_aloud_plays_then_toggle_stops() {
        let fx = Fixture::new();
        fx.with_story("从前有座山。").await;
        fx.client.speech(Ok(pcm_payload()));

        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Playing);
        assert_eq!(fx.client.spoken.lock().unwrap().as_slice(), ["从前有座山。"]);
        assert_eq!(fx.backend.state.voice_count(), 1);
        assert_eq!(
            fx.statuses(),
            vec![GenerationStatus::Idle, GenerationStatus::Loading, GenerationStatus::Playing]
        );

        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
        assert_eq!(fx.backend.state.stopped.lock().unwrap().len(), 1);

        // A stopped voice never reports completion
        let published = fx.published.lock().unwrap().len();
        assert_eq!(fx.backend.state.finish_all(), 0);
        assert_eq!(fx.published.lock().unwrap().len(), published);
        assert_eq!(fx.client.speech_calls(), 1);
    }

    #[tokio::test]
    async fn natural_completion_returns_to_idle() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Ok(pcm_payload()));
        fx.controller.toggle_read_aloud().await;

        assert_eq!(fx.backend.state.finish_all(), 1);
        assert_eq!(fx.controller.snapshot().audio_status, GenerationStatus::Idle);
        assert_eq!(fx.last_published().audio_status, GenerationStatus::Idle);
        assert!(fx.controller.snapshot().can_read_aloud);
    }

    #[tokio::test]
    async fn speech_failure_keeps_story() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Err(GenerationError::MissingAudio));

        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some(SPEECH_FAILED));
        assert_eq!(snapshot.story, "story");
        assert!(snapshot.can_read_aloud);

        fx.client.speech(Ok(pcm_payload()));
        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Playing);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn undecodable_audio_is_a_speech_failure() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Ok("not base64 at all!".into()));

        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Error);
        assert_eq!(fx.backend.state.voice_count(), 0);
    }

    #[tokio::test]
    async fn missing_output_device_is_a_speech_failure() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.backend.state.fail_open.store(true, Ordering::SeqCst);

        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Error);
        assert_eq!(fx.client.speech_calls(), 0);
    }

    #[tokio::test]
    async fn read_aloud_without_story_is_ignored() {
        let fx = Fixture::new();
        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
        assert_eq!(fx.client.speech_calls(), 0);
        assert!(!fx.controller.playback.is_open());
    }

    #[tokio::test]
    async fn speech_arriving_after_stop_is_not_played() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        let release = fx.client.gated_speech();

        let controller = fx.controller.clone();
        let pending = tokio::spawn(async move { controller.toggle_read_aloud().await });
        let client = fx.client.clone();
        wait_until(|| client.speech_calls() == 1).await;
        assert_eq!(fx.controller.snapshot().audio_status, GenerationStatus::Loading);

        // Toggling while loading is ignored
        let snapshot = fx.controller.toggle_read_aloud().await;
        assert_eq!(snapshot.audio_status, GenerationStatus::Loading);
        assert!(!snapshot.can_read_aloud);

        let snapshot = fx.controller.stop_read_aloud();
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);

        release.send(()).unwrap();
        let snapshot = pending.await.unwrap();
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
        assert_eq!(fx.backend.state.voice_count(), 0);
        assert_eq!(fx.client.speech_calls(), 1);
    }

    #[tokio::test]
    async fn new_image_stops_playback() {
        let fx = Fixture::new();
        fx.with_story("old").await;
        fx.client.speech(Ok(pcm_payload()));
        fx.controller.toggle_read_aloud().await;

        fx.client.story(Ok("new".into()));
        let snapshot = fx.controller.load_image(&fx.image("next.jpg", 32)).await;
        assert_eq!(snapshot.story, "new");
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
        assert_eq!(fx.backend.state.stopped.lock().unwrap().len(), 1);
        assert_eq!(fx.backend.state.finish_all(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_the_device() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Ok(pcm_payload()));
        fx.controller.toggle_read_aloud().await;

        fx.controller.shutdown();
        assert!(fx.backend.state.closed.load(Ordering::SeqCst));
        assert!(!fx.controller.playback.is_open());
        assert_eq!(fx.controller.snapshot().audio_status, GenerationStatus::Idle);
        assert_eq!(fx.backend.state.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_is_reused_across_readings() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        for _ in 0..3 {
            fx.client.speech(Ok(pcm_payload()));
            fx.controller.toggle_read_aloud().await;
            fx.backend.state.finish_all();
        }
        assert_eq!(fx.backend.state.opens.load(Ordering::SeqCst), 1);
        assert_eq!(fx.backend.state.voice_count(), 3);
    }

    #[tokio::test]
    async fn regenerating_stops_reading_aloud() {
        let fx = Fixture::new();
        fx.with_story("old story").await;
        fx.client.speech(Ok(pcm_payload()));
        fx.controller.toggle_read_aloud().await;
        let release = fx.client.gated_story("new story");

        let controller = fx.controller.clone();
        let pending = tokio::spawn(async move { controller.generate_story().await });
        let client = fx.client.clone();
        wait_until(|| client.describe_calls() == 2).await;

        let during = fx.controller.snapshot();
        assert!(during.is_generating_story);
        assert_eq!(during.story, "");
        assert_eq!(during.audio_status, GenerationStatus::Idle);
        assert_eq!(fx.backend.state.stopped.lock().unwrap().len(), 1);
        assert_eq!(fx.backend.state.finish_all(), 0);

        release.send(()).unwrap();
        let snapshot = pending.await.unwrap();
        assert_eq!(snapshot.story, "new story");
        assert_eq!(snapshot.audio_status, GenerationStatus::Idle);
    }

    #[tokio::test]
    async fn slow_device_open_does_not_block_the_runtime() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Ok(pcm_payload()));
        let (open, gate) = std::sync::mpsc::channel();
        *fx.backend.state.open_gate.lock().unwrap() = Some(gate);

        let controller = fx.controller.clone();
        let pending = tokio::spawn(async move { controller.toggle_read_aloud().await });
        let controller = fx.controller.clone();
        wait_until(|| controller.snapshot().audio_status == GenerationStatus::Loading).await;

        // Still waiting on the device while this task keeps running
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.client.speech_calls(), 0);
        assert_eq!(fx.controller.snapshot().audio_status, GenerationStatus::Loading);

        open.send(()).unwrap();
        let snapshot = pending.await.unwrap();
        assert_eq!(snapshot.audio_status, GenerationStatus::Playing);
        assert_eq!(fx.backend.state.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn image_is_published_once_per_change() {
        let fx = Fixture::new();
        fx.with_story("story").await;
        fx.client.speech(Ok(pcm_payload()));
        fx.controller.toggle_read_aloud().await;
        fx.backend.state.finish_all();

        let published = fx.published.lock().unwrap().clone();
        assert!(published.len() > 3);
        assert_eq!(published.iter().filter(|s| s.image.is_some()).count(), 1);
        assert!(published.iter().all(|s| s.has_image && s.image_epoch == 1));

        fx.client.story(Ok("next".into()));
        fx.controller.load_image(&fx.image("next.png", 16)).await;
        let with_image: Vec<u64> = fx
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.image.is_some())
            .map(|s| s.image_epoch)
            .collect();
        assert_eq!(with_image, vec![1, 2]);
    }

    #[tokio::test]
    async fn size_message_follows_configured_limit() {
        let fx = Fixture::new();
        let settings = Settings {
            max_image_bytes: 1024 * 1024,
            ..Settings::default()
        };
        fx.controller.reconfigure(fx.client.clone(), &settings);

        let snapshot = fx.controller.load_image(&fx.image("mid.jpg", 2 * 1024 * 1024)).await;
        assert_eq!(
            snapshot.error.as_deref(),
            Some("图片大小不能超过 1MB (Image must be under 1MB)")
        );
        assert_eq!(fx.client.describe_calls(), 0);
    }

    #[test]
    fn size_message_formats_partial_megabytes() {
        assert_eq!(
            image_too_large(1536 * 1024),
            "图片大小不能超过 1.5MB (Image must be under 1.5MB)"
        );
    }

    #[test]
    fn snapshot_serializes_for_the_web_view() {
        let session = StorySession::new();
        let value = serde_json::to_value(session.snapshot(true)).unwrap();
        assert_eq!(value["audioStatus"], "IDLE");
        assert_eq!(value["isGeneratingStory"], false);
        assert_eq!(value["canReadAloud"], false);
        assert!(value["image"].is_null());
        assert_eq!(value["hasImage"], false);
        assert_eq!(value["imageEpoch"], 0);
    }
}
