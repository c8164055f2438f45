use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::{Packet, codec, ffi, frame};

use crate::frame::SharedFrame;
use crate::session::{StreamKind, StreamSession};
use crate::sink::{CodecParams, FrameSink, FrameSource, PacketSink};

/// The device agent always captures audio as 48 kHz stereo; raw streams
/// carry no header from which the decoder could learn it.
pub const AUDIO_SAMPLE_RATE: i32 = 48_000;
pub const AUDIO_CHANNELS: i32 = 2;

enum Item {
    Packet(Packet),
    Session(StreamSession),
}

struct State {
    feed: Option<channel::Sender<Item>>,
    worker: Option<JoinHandle<()>>,
}

/// A packet sink that decodes on its own thread and fans decoded frames
/// out to at most two frame sinks.
///
/// When the decoded video size changes mid-stream (the device rotated or
/// reconfigured), an updated session descriptor is pushed downstream
/// before the first frame of the new size.
pub struct Decoder {
    kind: StreamKind,
    inner: Arc<Inner>,
}

struct Inner {
    source: FrameSource,
    state: Mutex<State>,
    failed: AtomicBool,
}

impl Decoder {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            inner: Arc::new(Inner {
                source: FrameSource::new(),
                state: Mutex::new(State {
                    feed: None,
                    worker: None,
                }),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Sinks must be registered before the decoder is shared.
    pub fn add_sink(&mut self, sink: Arc<dyn FrameSink>) {
        Arc::get_mut(&mut self.inner)
            .expect("sinks must be added before the decoder is started")
            .source
            .add_sink(sink);
    }

    fn open_video(
        codec: codec::Codec,
        session: &StreamSession,
    ) -> Result<(codec::decoder::Video, CodecParams), ffmpeg_next::Error> {
        let ctx = codec::context::Context::new_with_codec(codec);
        let video = ctx.decoder().video()?;

        let (width, height) = session.video_size.unwrap_or((0, 0));
        Ok((video, CodecParams::Video { width, height }))
    }

    fn open_audio(
        codec: codec::Codec,
        _session: &StreamSession,
    ) -> Result<(codec::decoder::Audio, CodecParams), ffmpeg_next::Error> {
        let mut ctx = codec::context::Context::new_with_codec(codec);

        // Raw PCM and ADTS-less AAC cannot discover the capture format
        // from the bitstream, it must be preset on the codec context.
        unsafe {
            let avctx = ctx.as_mut_ptr();
            (*avctx).sample_rate = AUDIO_SAMPLE_RATE;
            ffi::av_channel_layout_default(&mut (*avctx).ch_layout, AUDIO_CHANNELS);
        }

        let mut audio = ctx.decoder().audio()?;
        audio.set_channel_layout(ChannelLayout::STEREO);

        let params = CodecParams::Audio {
            sample_rate: audio.rate(),
            channel_layout: audio.channel_layout(),
            sample_format: audio.format(),
        };

        Ok((audio, params))
    }

    fn spawn_video_worker(
        inner: Arc<Inner>,
        mut video: codec::decoder::Video,
        mut session: StreamSession,
        rx: channel::Receiver<Item>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut decoded = frame::Video::empty();

            while let Ok(item) = rx.recv() {
                let packet = match item {
                    Item::Packet(packet) => packet,
                    Item::Session(new_session) => {
                        session = new_session;
                        if !inner.source.push_session(&session) {
                            inner.mark_failed();
                            return;
                        }
                        continue;
                    }
                };

                if let Err(err) = video.send_packet(&packet) {
                    log::error!("Video decoder error: {err}");
                    inner.mark_failed();
                    return;
                }

                while video.receive_frame(&mut decoded).is_ok() {
                    let size = (decoded.width(), decoded.height());
                    if session.video_size != Some(size) {
                        // In-band reconfiguration (rotation, resize)
                        session.video_size = Some(size);
                        if !inner.source.push_session(&session) {
                            inner.mark_failed();
                            return;
                        }
                    }

                    let Some(shared) = (unsafe { SharedFrame::from_av(decoded.as_ptr()) }) else {
                        inner.mark_failed();
                        return;
                    };
                    if !inner.source.push(&shared) {
                        inner.mark_failed();
                        return;
                    }
                }
            }
        })
    }

    fn spawn_audio_worker(
        inner: Arc<Inner>,
        mut audio: codec::decoder::Audio,
        rx: channel::Receiver<Item>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut decoded = frame::Audio::empty();

            while let Ok(item) = rx.recv() {
                let packet = match item {
                    Item::Packet(packet) => packet,
                    Item::Session(session) => {
                        if !inner.source.push_session(&session) {
                            inner.mark_failed();
                            return;
                        }
                        continue;
                    }
                };

                if let Err(err) = audio.send_packet(&packet) {
                    log::error!("Audio decoder error: {err}");
                    inner.mark_failed();
                    return;
                }

                while audio.receive_frame(&mut decoded).is_ok() {
                    let Some(shared) = (unsafe { SharedFrame::from_av(decoded.as_ptr()) }) else {
                        inner.mark_failed();
                        return;
                    };
                    if !inner.source.push(&shared) {
                        inner.mark_failed();
                        return;
                    }
                }
            }
        })
    }
}

impl Inner {
    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

impl PacketSink for Decoder {
    fn open(&self, session: &StreamSession) -> bool {
        let ffmpeg_id = session.codec_id.to_ffmpeg();
        let Some(codec) = codec::decoder::find(ffmpeg_id) else {
            log::error!("Decoder not found for {:?}", session.codec_id);
            return false;
        };

        let mut state = self.inner.state.lock().unwrap();

        let (tx, rx) = channel::unbounded();

        let worker = match self.kind {
            StreamKind::Video => {
                let (video, params) = match Self::open_video(codec, session) {
                    Ok(v) => v,
                    Err(err) => {
                        log::error!("Could not open video decoder: {err}");
                        return false;
                    }
                };
                if !self.inner.source.open(&params, session) {
                    return false;
                }
                Self::spawn_video_worker(self.inner.clone(), video, *session, rx)
            }
            StreamKind::Audio => {
                let (audio, params) = match Self::open_audio(codec, session) {
                    Ok(a) => a,
                    Err(err) => {
                        log::error!("Could not open audio decoder: {err}");
                        return false;
                    }
                };
                if !self.inner.source.open(&params, session) {
                    return false;
                }
                Self::spawn_audio_worker(self.inner.clone(), audio, rx)
            }
        };

        state.feed = Some(tx);
        state.worker = Some(worker);
        self.inner.failed.store(false, Ordering::Release);

        true
    }

    fn close(&self) {
        let (feed, worker) = {
            let mut state = self.inner.state.lock().unwrap();
            (state.feed.take(), state.worker.take())
        };

        // Dropping the sender ends the worker loop
        drop(feed);
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        self.inner.source.close();
    }

    fn push(&self, packet: &Packet) -> bool {
        if self.inner.failed.load(Ordering::Acquire) {
            return false;
        }

        let state = self.inner.state.lock().unwrap();
        let Some(feed) = &state.feed else {
            return false;
        };

        feed.send(Item::Packet(packet.clone())).is_ok()
    }

    fn push_session(&self, session: &StreamSession) -> bool {
        let state = self.inner.state.lock().unwrap();
        let Some(feed) = &state.feed else {
            return false;
        };

        feed.send(Item::Session(*session)).is_ok()
    }
}
