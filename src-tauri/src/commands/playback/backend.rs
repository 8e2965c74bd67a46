use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::error::PlaybackError;
use crate::audio_util::AudioSampleBuffer;

pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

// ── Voice state ──

/// State shared by a `PlaybackHandle` and the backend voice that plays it.
///
/// Natural completion and cancellation both race on `active`; whichever
/// clears it first decides whether the callback runs.
pub(crate) struct VoiceState {
    id: Uuid,
    active: AtomicBool,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl VoiceState {
    pub(crate) fn new(on_complete: CompletionCallback) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            active: AtomicBool::new(true),
            on_complete: Mutex::new(Some(on_complete)),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn take_callback(&self) -> Option<CompletionCallback> {
        self.on_complete
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Returns true if this call ran the completion callback.
    pub(crate) fn complete(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        // Lock released before the callback runs
        let callback = self.take_callback();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Returns true if the voice was still active. The callback is dropped unrun.
    pub(crate) fn cancel(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        drop(self.take_callback());
        true
    }
}

// ── Completion ──

/// What a backend receives for each voice: it can only report that the
/// voice finished (or was abandoned when the device went away).
#[derive(Clone)]
pub struct Completion(Arc<VoiceState>);

impl Completion {
    pub(crate) fn new(state: Arc<VoiceState>) -> Self {
        Self(state)
    }

    pub fn id(&self) -> Uuid {
        self.0.id()
    }

    /// The voice reached the end of its buffer.
    pub fn fire(&self) -> bool {
        self.0.complete()
    }

    /// The device is closing under the voice; no callback.
    pub fn abandon(&self) -> bool {
        self.0.cancel()
    }
}

// ── Backend traits ──

/// An opened output device. Owned by the `PlaybackController` for the whole
/// session and closed at teardown.
pub trait OutputDevice: Send {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Begin audible output of `buffer` right away. The backend calls
    /// `completion.fire()` once the buffer has been fully played.
    fn start_voice(
        &mut self,
        buffer: Arc<AudioSampleBuffer>,
        completion: Completion,
    ) -> Result<(), PlaybackError>;

    /// Silence and release one voice. Unknown or finished ids are ignored.
    fn stop_voice(&mut self, id: Uuid);

    /// Release the device. Voices still sounding are abandoned.
    fn close(&mut self);
}

/// Opens output devices (chosen once at startup).
pub trait OutputBackend: Send + Sync {
    fn open_default(&self) -> Result<Box<dyn OutputDevice>, PlaybackError>;
}
