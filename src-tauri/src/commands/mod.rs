pub mod playback;
pub mod settings;
pub mod story;
