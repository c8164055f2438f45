use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result as AResult, anyhow};
use crossbeam::channel::RecvTimeoutError;

use control::Controller;
use media::decoder::Decoder;
use media::delay_buffer::DelayBuffer;
use media::demuxer::{Demuxer, DemuxerStatus};
use media::player::AudioPlayer;
use media::recorder::{RecordFormat, Recorder};
use media::session::StreamKind;
use media::sink::FrameSink;
use mirror_common::Tick;

use crate::config::Config;
use crate::display::FrameWell;
use crate::events::{AppEvent, EventHub};

pub fn run(config: Config) -> AResult<()> {
    ffmpeg_next::init().context("could not initialize ffmpeg")?;

    let hub = EventHub::new();

    // Control channel (input towards the device, replies back)
    let control_socket = TcpStream::connect(&config.control_addr)
        .with_context(|| format!("could not connect control socket to {}", config.control_addr))?;
    let controller = Arc::new(Controller::new(control_socket));
    controller.start({
        let events = hub.sender();
        move || {
            let _ = events.send(AppEvent::ControllerError);
        }
    })?;

    // Recorder, shared by both packet streams
    let recorder = match &config.record {
        Some(path) => {
            let format = config
                .record_format
                .as_deref()
                .and_then(RecordFormat::from_name)
                .or_else(|| RecordFormat::from_path(path))
                .ok_or_else(|| anyhow!("cannot determine the record format of {}", path.display()))?;

            let events = hub.sender();
            let recorder = Arc::new(Recorder::new(
                path.clone(),
                format,
                config.record_orientation,
                config.audio,
                move |success| {
                    let _ = events.send(AppEvent::RecorderEnded(success));
                },
            ));
            recorder.start();
            Some((recorder, format))
        }
        None => None,
    };

    // Video pipeline: demuxer -> decoder -> [delay buffer] -> frame well
    //                         \-> recorder
    let video_socket = TcpStream::connect(&config.video_addr)
        .with_context(|| format!("could not connect video socket to {}", config.video_addr))?;

    let frame_well = Arc::new(FrameWell::new(hub.sender()));

    let mut video_decoder = Decoder::new(StreamKind::Video);
    if config.video_buffer > 0 {
        let mut delay = DelayBuffer::new(Tick::from_millis(config.video_buffer as i64), true);
        delay.add_sink(frame_well.clone() as Arc<dyn FrameSink>);
        video_decoder.add_sink(Arc::new(delay));
    } else {
        video_decoder.add_sink(frame_well.clone() as Arc<dyn FrameSink>);
    }

    let mut video_demuxer = Demuxer::new(StreamKind::Video, video_socket.try_clone()?);
    video_demuxer.add_sink(Arc::new(video_decoder));
    if let Some((recorder, format)) = &recorder {
        if format.has_video() {
            video_demuxer.add_sink(recorder.video_sink());
        }
    }

    let video_thread = video_demuxer.start({
        let events = hub.sender();
        move |kind, status| {
            let _ = events.send(AppEvent::DemuxerEnded { kind, status });
        }
    });

    // Audio pipeline: demuxer -> decoder -> player (regulator)
    //                         \-> recorder
    let mut audio_socket = None;
    let mut audio_thread = None;
    if config.audio {
        let socket = TcpStream::connect(&config.audio_addr)
            .with_context(|| format!("could not connect audio socket to {}", config.audio_addr))?;

        let player = Arc::new(AudioPlayer::new(
            Tick::from_millis(config.audio_buffer as i64),
            Tick::from_millis(config.audio_output_buffer as i64),
        ));

        let mut audio_decoder = Decoder::new(StreamKind::Audio);
        audio_decoder.add_sink(player);

        let mut audio_demuxer = Demuxer::new(StreamKind::Audio, socket.try_clone()?);
        audio_demuxer.add_sink(Arc::new(audio_decoder));
        if let Some((recorder, _)) = &recorder {
            audio_demuxer.add_sink(recorder.audio_sink());
        }

        audio_thread = Some(audio_demuxer.start({
            let events = hub.sender();
            move |kind, status| {
                let _ = events.send(AppEvent::DemuxerEnded { kind, status });
            }
        }));
        audio_socket = Some(socket);
    }

    log::info!("Session started");

    let deadline = config
        .time_limit
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut frames: u64 = 0;
    loop {
        let event = match deadline {
            Some(deadline) => match hub.receiver().recv_deadline(deadline) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    log::info!("Time limit reached");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match hub.receiver().recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            AppEvent::FrameAvailable => {
                // Rendering is delegated to the embedding shell; the
                // reference client only drains the well.
                if frame_well.take_frame().is_some() {
                    frames += 1;
                    if frames % 500 == 0 {
                        log::debug!("{frames} video frames presented");
                    }
                }
            }
            AppEvent::SessionChanged(session) => {
                log::info!("Video stream reconfigured: {:?}", session.video_size);
            }
            AppEvent::DemuxerEnded {
                kind: StreamKind::Video,
                status,
            } => {
                match status {
                    DemuxerStatus::Eos => log::info!("Device disconnected"),
                    DemuxerStatus::Error => log::error!("Video demuxer error"),
                    DemuxerStatus::Disabled => log::error!("Video stream disabled by the device"),
                }
                break;
            }
            AppEvent::DemuxerEnded {
                kind: StreamKind::Audio,
                status,
            } => {
                // The mirror keeps running without audio
                match status {
                    DemuxerStatus::Disabled => log::info!("Audio disabled at runtime"),
                    DemuxerStatus::Eos => log::info!("Audio stream ended"),
                    DemuxerStatus::Error => log::warn!("Audio demuxer error, continuing without audio"),
                }
            }
            AppEvent::ControllerError => {
                log::error!("Controller error");
                break;
            }
            AppEvent::RecorderEnded(success) => {
                if !success {
                    log::error!("Recorder failed");
                    break;
                }
                log::info!("Recording ended");
            }
        }
    }

    // Teardown, in reverse construction order: shutting the sockets down
    // unblocks every reader thread.
    let _ = video_socket.shutdown(Shutdown::Both);
    if let Some(socket) = &audio_socket {
        let _ = socket.shutdown(Shutdown::Both);
    }
    controller.stop();

    let _ = video_thread.join();
    if let Some(thread) = audio_thread {
        let _ = thread.join();
    }

    if let Some((recorder, _)) = &recorder {
        recorder.stop();
        recorder.join();
    }

    controller.join();

    log::info!("Session ended ({frames} frames)");

    Ok(())
}
