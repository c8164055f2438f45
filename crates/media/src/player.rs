use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel;

use mirror_common::Tick;

use crate::frame::SharedFrame;
use crate::regulator::AudioRegulator;
use crate::session::StreamSession;
use crate::sink::{CodecParams, FrameSink};

/// Frame sink playing the audio stream on the default output device.
///
/// The regulator sits between the decoding thread (push) and the audio
/// callback (pull). The cpal stream is created, driven and dropped on a
/// dedicated thread: streams are not movable across threads on every
/// backend.
pub struct AudioPlayer {
    /// Regulator latency target.
    target_buffering: Tick,
    /// Requested size of the device buffer, 0 for the backend default.
    output_buffer: Tick,
    inner: Mutex<Option<Inner>>,
}

struct Inner {
    regulator: Arc<AudioRegulator>,
    stop_tx: channel::Sender<()>,
    worker: JoinHandle<()>,
}

impl AudioPlayer {
    pub fn new(target_buffering: Tick, output_buffer: Tick) -> Self {
        Self {
            target_buffering,
            output_buffer,
            inner: Mutex::new(None),
        }
    }
}

fn run_stream(
    regulator: Arc<AudioRegulator>,
    sample_rate: u32,
    channels: u16,
    buffer_frames: u32,
    ready_tx: channel::Sender<bool>,
    stop_rx: channel::Receiver<()>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        log::error!("No audio output device");
        let _ = ready_tx.send(false);
        return;
    };

    let buffer_size = if buffer_frames > 0 {
        cpal::BufferSize::Fixed(buffer_frames)
    } else {
        cpal::BufferSize::Default
    };

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size,
    };

    let stream = {
        let regulator = regulator.clone();
        device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                regulator.pull_f32(data);
            },
            |err| log::error!("Audio output error: {err}"),
            None,
        )
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("Could not open audio output stream: {err}");
            let _ = ready_tx.send(false);
            return;
        }
    };

    if let Err(err) = stream.play() {
        log::error!("Could not start audio output stream: {err}");
        let _ = ready_tx.send(false);
        return;
    }

    let _ = ready_tx.send(true);

    // Keep the stream alive until close() (or until the player is
    // dropped, which disconnects the channel)
    let _ = stop_rx.recv();

    drop(stream);
    log::debug!("Audio player thread ended");
}

impl FrameSink for AudioPlayer {
    fn open(&self, params: &CodecParams, _session: &StreamSession) -> bool {
        let CodecParams::Audio {
            sample_rate,
            channel_layout,
            sample_format,
        } = *params
        else {
            log::error!("Audio player opened with video parameters");
            return false;
        };

        let target_samples =
            (self.target_buffering.as_millis() * sample_rate as i64 / 1000) as u32;
        let buffer_frames = (self.output_buffer.as_millis() * sample_rate as i64 / 1000) as u32;

        let regulator = match AudioRegulator::new(
            sample_rate,
            channel_layout,
            sample_format,
            target_samples,
        ) {
            Ok(regulator) => Arc::new(regulator),
            Err(err) => {
                log::error!("Could not create audio regulator: {err}");
                return false;
            }
        };

        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded(1);

        let worker = thread::spawn({
            let regulator = regulator.clone();
            let channels = channel_layout.channels().max(1) as u16;
            move || {
                run_stream(
                    regulator,
                    sample_rate,
                    channels,
                    buffer_frames,
                    ready_tx,
                    stop_rx,
                );
            }
        });

        if ready_rx.recv() != Ok(true) {
            let _ = worker.join();
            return false;
        }

        *self.inner.lock().unwrap() = Some(Inner {
            regulator,
            stop_tx,
            worker,
        });

        true
    }

    fn close(&self) {
        let Some(inner) = self.inner.lock().unwrap().take() else {
            return;
        };

        let _ = inner.stop_tx.send(());
        let _ = inner.worker.join();
    }

    fn push(&self, frame: &SharedFrame) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(inner) = inner.as_ref() else {
            return false;
        };

        inner.regulator.push(frame)
    }
}
