use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::collections::HashMap;
use std::panic;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use super::backend::{Completion, OutputBackend, OutputDevice};
use super::error::PlaybackError;
use crate::audio_util::AudioSampleBuffer;

/// Opens the host's default output device.
pub struct CpalBackend;

impl OutputBackend for CpalBackend {
    fn open_default(&self) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        Ok(Box::new(CpalOutputDevice::open()?))
    }
}

// ── Device thread protocol ──

enum DeviceCommand {
    Start {
        buffer: Arc<AudioSampleBuffer>,
        completion: Completion,
        reply: SyncSender<Result<(), PlaybackError>>,
    },
    Stop(Uuid),
    /// Sent from the stream callback once every frame has been written.
    Drained(Uuid),
    Shutdown,
}

struct OpenedOutput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    name: String,
}

struct Voice {
    _stream: cpal::Stream,
    completion: Completion,
}

// ── CpalOutputDevice ──

/// Default output device, driven from a dedicated thread.
///
/// cpal::Stream is !Send, so every stream is created, kept and dropped on
/// that thread; the rest of the app only holds the command channel.
pub struct CpalOutputDevice {
    name: String,
    sample_rate: u32,
    channels: u16,
    commands: Sender<DeviceCommand>,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutputDevice {
    pub fn open() -> Result<Self, PlaybackError> {
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let events = commands.clone();

        let worker = thread::Builder::new()
            .name("speech-output".to_string())
            .spawn(move || {
                let output = match open_default_output() {
                    Ok(output) => output,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((
                    output.name.clone(),
                    output.config.sample_rate.0,
                    output.config.channels,
                )));
                run_device(output, inbox, events);
            })
            .map_err(|e| PlaybackError::StreamBuild(format!("Failed to spawn output thread: {}", e)))?;

        let (name, sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| PlaybackError::DeviceClosed)??;

        Ok(Self {
            name,
            sample_rate,
            channels,
            commands,
            worker: Some(worker),
        })
    }
}

impl OutputDevice for CpalOutputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn start_voice(
        &mut self,
        buffer: Arc<AudioSampleBuffer>,
        completion: Completion,
    ) -> Result<(), PlaybackError> {
        let (reply, result) = mpsc::sync_channel(1);
        self.commands
            .send(DeviceCommand::Start { buffer, completion, reply })
            .map_err(|_| PlaybackError::DeviceClosed)?;
        result.recv().map_err(|_| PlaybackError::DeviceClosed)?
    }

    fn stop_voice(&mut self, id: Uuid) {
        let _ = self.commands.send(DeviceCommand::Stop(id));
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(DeviceCommand::Shutdown);
            if worker.join().is_err() {
                log::warn!("Output thread for '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for CpalOutputDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_default_output() -> Result<OpenedOutput, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::DeviceConfig(e.to_string()))?;

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    Ok(OpenedOutput {
        device,
        config,
        sample_format,
        name,
    })
}

fn run_device(output: OpenedOutput, inbox: Receiver<DeviceCommand>, events: Sender<DeviceCommand>) {
    let mut voices: HashMap<Uuid, Voice> = HashMap::new();

    while let Ok(command) = inbox.recv() {
        match command {
            DeviceCommand::Start { buffer, completion, reply } => {
                let id = completion.id();
                match start_stream(&output, &buffer, id, events.clone()) {
                    Ok(stream) => {
                        voices.insert(id, Voice { _stream: stream, completion });
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        log::error!("Failed to start voice {}: {}", id, e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            DeviceCommand::Stop(id) => {
                if voices.remove(&id).is_some() {
                    log::debug!("Voice {} released", id);
                }
            }
            DeviceCommand::Drained(id) => {
                if let Some(voice) = voices.remove(&id) {
                    let Voice { _stream, completion } = voice;
                    drop(_stream);
                    completion.fire();
                }
            }
            DeviceCommand::Shutdown => break,
        }
    }

    for (_, voice) in voices.drain() {
        voice.completion.abandon();
    }
    log::info!("Output thread for '{}' exiting", output.name);
}

fn start_stream(
    output: &OpenedOutput,
    buffer: &AudioSampleBuffer,
    id: Uuid,
    events: Sender<DeviceCommand>,
) -> Result<cpal::Stream, PlaybackError> {
    let samples = render_for_device(buffer, output.config.sample_rate.0, output.config.channels)?;
    let stream = build_output_stream_dispatch(
        &output.device,
        &output.config,
        output.sample_format,
        samples,
        id,
        events,
    )?;
    stream
        .play()
        .map_err(|e| PlaybackError::StreamPlay(e.to_string()))?;
    Ok(stream)
}

// ── Rendering ──

/// Resample `buffer` to the device rate and lay it out interleaved for the
/// device channel count.
pub(crate) fn render_for_device(
    buffer: &AudioSampleBuffer,
    device_rate: u32,
    device_channels: u16,
) -> Result<Vec<f32>, PlaybackError> {
    if buffer.is_empty() || device_channels == 0 {
        return Ok(Vec::new());
    }

    let resampled;
    let source = if buffer.sample_rate() == device_rate {
        buffer
    } else {
        resampled = resample(buffer, device_rate)?;
        &resampled
    };

    if source.channel_count() == device_channels as usize {
        return Ok(source.interleaved());
    }
    Ok(map_channels(source, device_channels as usize))
}

/// One-shot sinc resample of the whole buffer. The filter delay is trimmed
/// from the front and the tail is flushed out, so the result lines up with
/// the input and keeps its last frames.
fn resample(buffer: &AudioSampleBuffer, target_rate: u32) -> Result<AudioSampleBuffer, PlaybackError> {
    let frames = buffer.frame_count();
    let ratio = target_rate as f64 / buffer.sample_rate() as f64;
    let target_len = (frames as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, frames, buffer.channel_count())
        .map_err(|e| PlaybackError::Resample(format!("Failed to create resampler: {}", e)))?;
    let delay = resampler.output_delay();

    let mut planes = resampler
        .process(buffer.channels(), None)
        .map_err(|e| PlaybackError::Resample(e.to_string()))?;

    let needed = delay + target_len;
    let mut flushes = 0;
    while planes.first().map(|p| p.len()).unwrap_or(0) < needed && flushes < 4 {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| PlaybackError::Resample(e.to_string()))?;
        for (plane, extra) in planes.iter_mut().zip(tail) {
            plane.extend(extra);
        }
        flushes += 1;
    }

    for plane in planes.iter_mut() {
        plane.drain(..delay.min(plane.len()));
        plane.resize(target_len, 0.0);
    }
    Ok(AudioSampleBuffer::from_planes(target_rate, planes))
}

/// Interleave source channels onto `out_channels` device channels.
///
/// Mono is copied to every output; a mono device gets the average of the
/// source channels; otherwise channel `c` goes to output `c` and extra
/// outputs stay silent.
pub(crate) fn map_channels(buffer: &AudioSampleBuffer, out_channels: usize) -> Vec<f32> {
    let planes: Vec<&[f32]> = (0..buffer.channel_count())
        .filter_map(|c| buffer.channel(c))
        .collect();
    let frames = buffer.frame_count();
    let mut out = Vec::with_capacity(frames * out_channels);

    for frame in 0..frames {
        if out_channels == 1 {
            let sum: f32 = planes.iter().map(|p| p[frame]).sum();
            out.push(sum / planes.len() as f32);
            continue;
        }
        for ch in 0..out_channels {
            let value = if planes.len() == 1 {
                planes[0][frame]
            } else {
                planes.get(ch).map(|p| p[frame]).unwrap_or(0.0)
            };
            out.push(value);
        }
    }
    out
}

/// Copy the next samples into a device buffer, padding with silence past
/// the end. Returns true once every sample has been written.
pub(crate) fn fill_output<T: Sample + FromSample<f32>>(
    data: &mut [T],
    samples: &[f32],
    cursor: &mut usize,
) -> bool {
    for slot in data.iter_mut() {
        let value = samples.get(*cursor).copied().unwrap_or(0.0);
        *slot = T::from_sample(value);
        if *cursor < samples.len() {
            *cursor += 1;
        }
    }
    *cursor >= samples.len()
}

// ── Stream construction ──

fn build_output_stream<T: SizedSample + FromSample<f32> + Send + 'static>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Vec<f32>,
    id: Uuid,
    events: Sender<DeviceCommand>,
) -> Result<cpal::Stream, PlaybackError> {
    let mut cursor = 0usize;
    let mut drained = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // ALSA timing panics must not take the output thread down
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    fill_output(data, &samples, &mut cursor)
                }));
                match result {
                    Ok(true) if !drained => {
                        drained = true;
                        let _ = events.send(DeviceCommand::Drained(id));
                    }
                    Ok(_) => {}
                    Err(_) => log::warn!("Playback callback panic caught (ALSA timing issue)"),
                }
            },
            |err| log::error!("Playback output error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::StreamBuild(e.to_string()))
}

fn build_output_stream_dispatch(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: SampleFormat,
    samples: Vec<f32>,
    id: Uuid,
    events: Sender<DeviceCommand>,
) -> Result<cpal::Stream, PlaybackError> {
    match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(device, config, samples, id, events),
        SampleFormat::I16 => build_output_stream::<i16>(device, config, samples, id, events),
        SampleFormat::U16 => build_output_stream::<u16>(device, config, samples, id, events),
        SampleFormat::I32 => build_output_stream::<i32>(device, config, samples, id, events),
        SampleFormat::U8 => build_output_stream::<u8>(device, config, samples, id, events),
        fmt => Err(PlaybackError::UnsupportedFormat(format!("{:?}", fmt))),
    }
}
