/// Errors from the output side of the audio stack.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Failed to get output config: {0}")]
    DeviceConfig(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to build output stream: {0}")]
    StreamBuild(String),
    #[error("Failed to start output stream: {0}")]
    StreamPlay(String),
    #[error("Resampling failed: {0}")]
    Resample(String),
    #[error("Output device is closed")]
    DeviceClosed,
    #[error("Output worker failed: {0}")]
    Worker(String),
}
