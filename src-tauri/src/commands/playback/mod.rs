//! Single-shot playback of decoded speech.
//!
//! The output device is opened lazily on first use and kept for the rest of
//! the session. Each `play` creates a voice with its own `PlaybackHandle`;
//! `stop` cancels it silently, natural completion runs the callback once.

pub mod backend;
pub mod cpal_backend;
pub mod error;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::audio_util::AudioSampleBuffer;
use backend::{Completion, OutputBackend, OutputDevice, VoiceState};
use error::PlaybackError;

/// One playback operation started by [`PlaybackController::play`].
pub struct PlaybackHandle {
    state: Arc<VoiceState>,
}

impl PlaybackHandle {
    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    /// False once the buffer finished or the handle was stopped.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct PlaybackController {
    backend: Arc<dyn OutputBackend>,
    device: Mutex<Option<Box<dyn OutputDevice>>>,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn OutputBackend>) -> Self {
        Self {
            backend,
            device: Mutex::new(None),
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<Box<dyn OutputDevice>>> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<Box<dyn OutputDevice>>,
    ) -> Result<&'a mut Box<dyn OutputDevice>, PlaybackError> {
        if slot.is_none() {
            let device = self.backend.open_default()?;
            log::info!(
                "Output device opened: '{}' {}Hz {}ch",
                device.name(),
                device.sample_rate(),
                device.channels()
            );
            *slot = Some(device);
        }
        slot.as_mut().ok_or(PlaybackError::DeviceClosed)
    }

    /// Open the output device ahead of time. No-op when already open.
    pub fn prepare(&self) -> Result<(), PlaybackError> {
        let mut guard = self.lock_device();
        self.ensure_open(&mut guard).map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.lock_device().is_some()
    }

    /// Start playing `buffer` immediately.
    ///
    /// Does not stop other handles; the caller keeps at most one active.
    pub fn play(
        &self,
        buffer: Arc<AudioSampleBuffer>,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<PlaybackHandle, PlaybackError> {
        let mut guard = self.lock_device();
        let device = self.ensure_open(&mut guard)?;

        let state = VoiceState::new(Box::new(on_complete));
        let frames = buffer.frame_count();
        let duration = buffer.duration();
        device.start_voice(buffer, Completion::new(state.clone()))?;

        log::info!(
            "Playback {} started: {} frames ({:.2}s)",
            state.id(),
            frames,
            duration.as_secs_f64()
        );
        Ok(PlaybackHandle { state })
    }

    /// Cancel a playback. Stopping twice, or after it finished, does nothing.
    pub fn stop(&self, handle: &PlaybackHandle) {
        if !handle.state.cancel() {
            return;
        }
        if let Some(device) = self.lock_device().as_mut() {
            device.stop_voice(handle.id());
        }
        log::info!("Playback {} stopped", handle.id());
    }

    /// Release the output device. The next `play` reopens it.
    pub fn close(&self) {
        let device = self.lock_device().take();
        if let Some(mut device) = device {
            device.close();
            log::info!("Output device '{}' closed", device.name());
        }
    }
}
