use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_next::{Packet, Rational, ffi, format};

use crate::session::{StreamKind, StreamSession};
use crate::sink::PacketSink;

/// Duration assigned to the very last packet of each stream, whose real
/// duration cannot be inferred from a successor.
const LAST_PACKET_DURATION_US: i64 = 100_000;

/// Bounded wait for the lagging stream before writing the other side
/// anyway.
const LAGGING_STREAM_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Mp4,
    Mkv,
    M4a,
    Mka,
    Opus,
    Aac,
    Flac,
    Wav,
}

impl RecordFormat {
    pub fn from_name(name: &str) -> Option<RecordFormat> {
        match name {
            "mp4" => Some(RecordFormat::Mp4),
            "mkv" => Some(RecordFormat::Mkv),
            "m4a" => Some(RecordFormat::M4a),
            "mka" => Some(RecordFormat::Mka),
            "opus" => Some(RecordFormat::Opus),
            "aac" => Some(RecordFormat::Aac),
            "flac" => Some(RecordFormat::Flac),
            "wav" => Some(RecordFormat::Wav),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<RecordFormat> {
        let ext = path.extension()?.to_str()?;
        Self::from_name(&ext.to_ascii_lowercase())
    }

    /// Name of the matching libavformat muxer.
    fn muxer_name(self) -> &'static str {
        match self {
            RecordFormat::Mp4 => "mp4",
            RecordFormat::Mkv => "matroska",
            RecordFormat::M4a => "ipod",
            RecordFormat::Mka => "matroska",
            RecordFormat::Opus => "opus",
            RecordFormat::Aac => "adts",
            RecordFormat::Flac => "flac",
            RecordFormat::Wav => "wav",
        }
    }

    pub fn has_video(self) -> bool {
        matches!(self, RecordFormat::Mp4 | RecordFormat::Mkv)
    }
}

/// Holds back each packet until its successor arrives, so that the
/// duration (absent from the wire protocol) can be computed
/// retroactively.
struct DurationFiller {
    previous: Option<Packet>,
}

impl DurationFiller {
    fn new() -> Self {
        Self { previous: None }
    }

    /// Queue `next` and return the packet that became ready, its
    /// duration set to the PTS delta.
    fn push(&mut self, next: Packet) -> Option<Packet> {
        let ready = self.previous.take().map(|mut packet| {
            if let (Some(pts), Some(next_pts)) = (packet.pts(), next.pts()) {
                packet.set_duration(next_pts - pts);
            }
            packet
        });
        self.previous = Some(next);
        ready
    }

    /// Flush the held-back packet with the fallback duration.
    fn finish(&mut self) -> Option<Packet> {
        self.previous.take().map(|mut packet| {
            packet.set_duration(LAST_PACKET_DURATION_US);
            packet
        })
    }
}

/// Pure selection rule of the writer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Select {
    Video,
    Audio,
    /// Both queues empty, packets may still arrive.
    WaitAny,
    /// One queue filled but the other side still expects packets:
    /// interleaving by PTS requires waiting (bounded) for the laggard.
    WaitLagging,
    Eos,
}

fn select_next(
    video_pts: Option<i64>,
    video_pending: bool,
    audio_pts: Option<i64>,
    audio_pending: bool,
    lagging_expired: bool,
) -> Select {
    match (video_pts, audio_pts) {
        (Some(v), Some(a)) => {
            if a < v {
                Select::Audio
            } else {
                Select::Video
            }
        }
        (Some(_), None) => {
            if audio_pending && !lagging_expired {
                Select::WaitLagging
            } else {
                Select::Video
            }
        }
        (None, Some(_)) => {
            if video_pending && !lagging_expired {
                Select::WaitLagging
            } else {
                Select::Audio
            }
        }
        (None, None) => {
            if video_pending || audio_pending {
                Select::WaitAny
            } else {
                Select::Eos
            }
        }
    }
}

struct StreamState {
    queue: VecDeque<Packet>,
    session: Option<StreamSession>,
    extradata: Option<Vec<u8>>,
    expects_config: bool,
    opened: bool,
    finished: bool,
    /// Cleared when the demuxer reports that the stream will never
    /// start.
    active: bool,
    index: usize,
}

impl StreamState {
    fn new(active: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            session: None,
            extradata: None,
            expects_config: false,
            opened: false,
            finished: false,
            active,
            index: 0,
        }
    }

    /// Whether the start-up barrier can pass for this stream.
    fn ready(&self) -> bool {
        if !self.active {
            return true;
        }
        self.opened && (!self.expects_config || self.extradata.is_some())
    }

    /// Whether more packets may still arrive.
    fn pending(&self) -> bool {
        self.active && !self.finished
    }
}

struct RecState {
    video: StreamState,
    audio: StreamState,
    stopped: bool,
    failed: bool,
}

impl RecState {
    fn stream(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }
}

struct Shared {
    filename: PathBuf,
    format: RecordFormat,
    /// Clockwise display orientation in degrees, stored as a
    /// display-matrix side data entry on the video stream.
    orientation: u32,
    has_video: bool,
    has_audio: bool,
    state: Mutex<RecState>,
    cond: Condvar,
    on_ended: Box<dyn Fn(bool) + Send + Sync>,
}

/// Muxes the demuxed packets of both streams into a container file, out
/// of thread.
///
/// Packets are accepted before the muxer knows which streams exist; the
/// worker blocks until every expected stream is initialised, then writes
/// packets interleaved by PTS.
pub struct Recorder {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(
        filename: impl Into<PathBuf>,
        format: RecordFormat,
        orientation: u32,
        expects_audio: bool,
        on_ended: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        let has_video = format.has_video();
        let has_audio = expects_audio;

        Self {
            shared: Arc::new(Shared {
                filename: filename.into(),
                format,
                orientation,
                has_video,
                has_audio,
                state: Mutex::new(RecState {
                    video: StreamState::new(has_video),
                    audio: StreamState::new(has_audio),
                    stopped: false,
                    failed: false,
                }),
                cond: Condvar::new(),
                on_ended: Box::new(on_ended),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the writer thread. Must be called before the demuxers
    /// start.
    pub fn start(&self) {
        let shared = self.shared.clone();
        *self.worker.lock().unwrap() = Some(thread::spawn(move || run_recorder(shared)));
    }

    /// Idempotent, callable from any thread.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stopped = true;
        state.video.finished = true;
        state.audio.finished = true;
        self.shared.cond.notify_all();
    }

    pub fn join(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    pub fn video_sink(&self) -> Arc<dyn PacketSink> {
        Arc::new(RecorderSink {
            shared: self.shared.clone(),
            kind: StreamKind::Video,
        })
    }

    pub fn audio_sink(&self) -> Arc<dyn PacketSink> {
        Arc::new(RecorderSink {
            shared: self.shared.clone(),
            kind: StreamKind::Audio,
        })
    }
}

struct RecorderSink {
    shared: Arc<Shared>,
    kind: StreamKind,
}

impl PacketSink for RecorderSink {
    fn open(&self, session: &StreamSession) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.failed {
            return false;
        }

        let expects_config = session.codec_id.expects_config_packet();
        let stream = state.stream(self.kind);
        stream.session = Some(*session);
        stream.expects_config = expects_config;
        stream.opened = true;
        stream.finished = false;

        self.shared.cond.notify_all();
        true
    }

    fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stream(self.kind).finished = true;
        self.shared.cond.notify_all();
    }

    fn push(&self, packet: &Packet) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped || state.failed {
            return false;
        }

        let stream = state.stream(self.kind);

        if stream.expects_config && stream.extradata.is_none() {
            // The first packet carries the codec config; it must be
            // installed as stream extradata before the header is written.
            stream.extradata = Some(packet.data().unwrap_or_default().to_vec());
        }

        stream.queue.push_back(packet.clone());
        self.shared.cond.notify_all();

        true
    }

    fn disable(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stream(self.kind).active = false;
        self.shared.cond.notify_all();
    }
}

struct OutputStream {
    index: usize,
    time_base: Rational,
    filler: DurationFiller,
}

fn run_recorder(shared: Arc<Shared>) {
    let success = run_recorder_inner(&shared);

    log::info!(
        "Recording {} to {}",
        if success { "complete" } else { "failed" },
        shared.filename.display()
    );

    (shared.on_ended)(success);
}

fn run_recorder_inner(shared: &Shared) -> bool {
    // Start-up barrier: wait until every expected stream is initialised
    // (or went inactive), so the container header can be written with
    // the complete stream layout.
    let (video_init, audio_init) = {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.stopped || state.failed {
                return false;
            }

            let video_ready = !shared.has_video || state.video.ready();
            let audio_ready = !shared.has_audio || state.audio.ready();
            if video_ready && audio_ready {
                let video = (shared.has_video && state.video.active)
                    .then(|| (state.video.session.unwrap(), state.video.extradata.clone()));
                let audio = (shared.has_audio && state.audio.active)
                    .then(|| (state.audio.session.unwrap(), state.audio.extradata.clone()));
                break (video, audio);
            }

            state = shared.cond.wait(state).unwrap();
        }
    };

    if video_init.is_none() && audio_init.is_none() {
        log::error!("Recorder has no stream to record");
        return false;
    }

    let mut octx = match format::output_as(&shared.filename, shared.format.muxer_name()) {
        Ok(octx) => octx,
        Err(err) => {
            log::error!(
                "Could not open output file {}: {err}",
                shared.filename.display()
            );
            drain(shared);
            return false;
        }
    };

    let mut video_out = None;
    let mut audio_out = None;

    if let Some((session, extradata)) = &video_init {
        match add_stream(&mut octx, session, extradata.as_deref(), shared.orientation) {
            Ok(index) => {
                video_out = Some(OutputStream {
                    index,
                    time_base: Rational::new(1, 1_000_000),
                    filler: DurationFiller::new(),
                })
            }
            Err(err) => {
                log::error!("Could not create video output stream: {err}");
                drain(shared);
                return false;
            }
        }
    }

    if let Some((session, extradata)) = &audio_init {
        match add_stream(&mut octx, session, extradata.as_deref(), 0) {
            Ok(index) => {
                audio_out = Some(OutputStream {
                    index,
                    time_base: Rational::new(1, 1_000_000),
                    filler: DurationFiller::new(),
                })
            }
            Err(err) => {
                log::error!("Could not create audio output stream: {err}");
                drain(shared);
                return false;
            }
        }
    }

    if let Err(err) = octx.write_header() {
        log::error!("Could not write container header: {err}");
        drain(shared);
        return false;
    }

    // The muxer may have overridden the requested time bases
    if let Some(out) = &mut video_out {
        out.time_base = octx.stream(out.index).unwrap().time_base();
    }
    if let Some(out) = &mut audio_out {
        out.time_base = octx.stream(out.index).unwrap().time_base();
    }

    log::info!(
        "Recording started to {} file: {}",
        shared.format.muxer_name(),
        shared.filename.display()
    );

    loop {
        let (kind, packet) = {
            let mut state = shared.state.lock().unwrap();
            let mut lagging_expired = false;

            loop {
                if state.failed {
                    return false;
                }

                // a queued packet without a PTS sorts first
                let choice = select_next(
                    state.video.queue.front().map(|p| p.pts().unwrap_or(i64::MIN)),
                    state.video.pending(),
                    state.audio.queue.front().map(|p| p.pts().unwrap_or(i64::MIN)),
                    state.audio.pending(),
                    lagging_expired,
                );

                match choice {
                    Select::Video => {
                        break (StreamKind::Video, state.video.queue.pop_front().unwrap());
                    }
                    Select::Audio => {
                        break (StreamKind::Audio, state.audio.queue.pop_front().unwrap());
                    }
                    Select::WaitAny => {
                        state = shared.cond.wait(state).unwrap();
                        lagging_expired = false;
                    }
                    Select::WaitLagging => {
                        let (guard, wait) = shared
                            .cond
                            .wait_timeout(state, LAGGING_STREAM_WAIT)
                            .unwrap();
                        state = guard;
                        lagging_expired = wait.timed_out();
                    }
                    Select::Eos => {
                        drop(state);
                        return finish(shared, &mut octx, &mut video_out, &mut audio_out);
                    }
                }
            }
        };

        let out = match kind {
            StreamKind::Video => video_out.as_mut(),
            StreamKind::Audio => audio_out.as_mut(),
        };
        let Some(out) = out else {
            // A packet for a stream that is not being recorded
            continue;
        };

        if let Some(ready) = out.filler.push(packet) {
            if !write_packet(&mut octx, out, ready) {
                mark_failed(shared);
                return false;
            }
        }
    }
}

fn finish(
    shared: &Shared,
    octx: &mut format::context::Output,
    video_out: &mut Option<OutputStream>,
    audio_out: &mut Option<OutputStream>,
) -> bool {
    for out in [video_out, audio_out].into_iter().flatten() {
        if let Some(last) = out.filler.finish() {
            if !write_packet(octx, out, last) {
                mark_failed(shared);
                return false;
            }
        }
    }

    if let Err(err) = octx.write_trailer() {
        log::error!("Could not write container trailer: {err}");
        return false;
    }

    true
}

fn write_packet(
    octx: &mut format::context::Output,
    out: &mut OutputStream,
    mut packet: Packet,
) -> bool {
    packet.set_stream(out.index);
    packet.rescale_ts(Rational::new(1, 1_000_000), out.time_base);

    if let Err(err) = packet.write_interleaved(octx) {
        log::error!("Could not write packet: {err}");
        return false;
    }

    true
}

fn mark_failed(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    state.failed = true;
    state.video.queue.clear();
    state.audio.queue.clear();
    shared.cond.notify_all();
}

fn drain(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    state.failed = true;
    state.video.queue.clear();
    state.audio.queue.clear();
}

/// Create an output stream for `session`. The safe wrapper exposes
/// stream creation only through an encoder context, which does not exist
/// here: packets are muxed as-is, so the stream parameters are filled in
/// directly.
fn add_stream(
    octx: &mut format::context::Output,
    session: &StreamSession,
    extradata: Option<&[u8]>,
    orientation: u32,
) -> Result<usize, ffmpeg_next::Error> {
    unsafe {
        let st = ffi::avformat_new_stream(octx.as_mut_ptr(), std::ptr::null());
        if st.is_null() {
            return Err(ffmpeg_next::Error::Unknown);
        }

        (*st).time_base = ffi::AVRational {
            num: 1,
            den: 1_000_000,
        };

        let par = (*st).codecpar;
        (*par).codec_id = session.codec_id.to_ffmpeg().into();

        if let Some((width, height)) = session.video_size {
            (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).width = width as i32;
            (*par).height = height as i32;
        } else {
            (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*par).sample_rate = crate::decoder::AUDIO_SAMPLE_RATE;
            ffi::av_channel_layout_default(&mut (*par).ch_layout, crate::decoder::AUDIO_CHANNELS);
            if session.codec_id == crate::session::CodecId::Raw {
                (*par).format = ffi::AVSampleFormat::AV_SAMPLE_FMT_S16 as i32;
            }
        }

        if let Some(data) = extradata {
            let buf =
                ffi::av_mallocz(data.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
            if buf.is_null() {
                return Err(ffmpeg_next::Error::Unknown);
            }
            std::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
            (*par).extradata = buf;
            (*par).extradata_size = data.len() as i32;
        }

        if orientation != 0 && session.video_size.is_some() {
            let side = ffi::av_packet_side_data_new(
                &mut (*par).coded_side_data,
                &mut (*par).nb_coded_side_data,
                ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
                9 * std::mem::size_of::<i32>(),
                0,
            );
            if !side.is_null() {
                ffi::av_display_rotation_set((*side).data as *mut i32, -(orientation as f64));
            }
        }

        Ok((*st).index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CodecId;

    fn packet(pts: i64) -> Packet {
        let mut packet = Packet::copy(&[0u8; 8]);
        packet.set_pts(Some(pts));
        packet.set_dts(Some(pts));
        packet
    }

    #[test]
    fn test_duration_inference() {
        let mut filler = DurationFiller::new();

        assert!(filler.push(packet(0)).is_none());

        let first = filler.push(packet(20_000)).unwrap();
        assert_eq!(first.pts(), Some(0));
        assert_eq!(first.duration(), 20_000);

        let second = filler.push(packet(40_000)).unwrap();
        assert_eq!(second.pts(), Some(20_000));
        assert_eq!(second.duration(), 20_000);

        // the very last packet gets the fallback duration
        let last = filler.finish().unwrap();
        assert_eq!(last.pts(), Some(40_000));
        assert_eq!(last.duration(), 100_000);

        assert!(filler.finish().is_none());
    }

    #[test]
    fn test_select_lowest_pts_across_streams() {
        assert_eq!(
            select_next(Some(30), true, Some(10), true, false),
            Select::Audio
        );
        assert_eq!(
            select_next(Some(10), true, Some(30), true, false),
            Select::Video
        );
        // tie goes to video
        assert_eq!(
            select_next(Some(10), true, Some(10), true, false),
            Select::Video
        );
    }

    #[test]
    fn test_select_waits_for_lagging_active_stream() {
        // audio queue empty but audio still active: wait (bounded)
        assert_eq!(
            select_next(Some(10), true, None, true, false),
            Select::WaitLagging
        );
        // after the bounded wait expired, write what is available
        assert_eq!(
            select_next(Some(10), true, None, true, true),
            Select::Video
        );
        // audio disabled or finished: no reason to wait
        assert_eq!(
            select_next(Some(10), true, None, false, false),
            Select::Video
        );
    }

    #[test]
    fn test_select_eos_only_when_nothing_pending() {
        assert_eq!(select_next(None, true, None, false, false), Select::WaitAny);
        assert_eq!(select_next(None, false, None, true, false), Select::WaitAny);
        assert_eq!(select_next(None, false, None, false, false), Select::Eos);
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(RecordFormat::from_name("mkv"), Some(RecordFormat::Mkv));
        assert_eq!(
            RecordFormat::from_path(Path::new("/tmp/capture.MP4")),
            Some(RecordFormat::Mp4)
        );
        assert_eq!(RecordFormat::from_path(Path::new("/tmp/capture.xyz")), None);
        assert!(RecordFormat::Mp4.has_video());
        assert!(!RecordFormat::Opus.has_video());
    }

    #[test]
    fn test_stream_readiness() {
        let mut stream = StreamState::new(true);
        assert!(!stream.ready());

        stream.opened = true;
        stream.expects_config = true;
        assert!(!stream.ready());

        stream.extradata = Some(vec![1, 2, 3]);
        assert!(stream.ready());

        // an inactive stream never blocks the barrier
        let disabled = StreamState::new(false);
        assert!(disabled.ready());
        assert!(!disabled.pending());
    }

    #[test]
    fn test_audio_only_recording_end_to_end() {
        ffmpeg_next::init().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.mka");

        let (ended_tx, ended_rx) = crossbeam::channel::unbounded();
        let recorder = Recorder::new(&path, RecordFormat::Mka, 0, true, move |success| {
            let _ = ended_tx.send(success);
        });
        recorder.start();

        let sink = recorder.audio_sink();
        let session = StreamSession::audio(CodecId::Opus);
        assert!(sink.open(&session));

        // first packet carries the codec config (merged by the demuxer)
        let mut config = Packet::copy(&[
            b'O', b'p', b'u', b's', b'H', b'e', b'a', b'd', 1, 2, 0, 0, 0x80, 0xbb, 0, 0, 0, 0, 0,
        ]);
        config.set_pts(Some(0));
        config.set_dts(Some(0));
        assert!(sink.push(&config));

        for pts in [20_000i64, 40_000] {
            let mut packet = Packet::copy(&[0xfc, 0xff, 0xfe]);
            packet.set_pts(Some(pts));
            packet.set_dts(Some(pts));
            assert!(sink.push(&packet));
        }

        sink.close();
        recorder.join();

        assert_eq!(ended_rx.recv().unwrap(), true);
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }

    #[test]
    fn test_push_after_stop_fails() {
        let recorder = Recorder::new("/tmp/never-written.mkv", RecordFormat::Mkv, 0, false, |_| {});
        let sink = recorder.video_sink();

        recorder.stop();
        let mut packet = Packet::copy(&[0u8; 4]);
        packet.set_pts(Some(0));
        assert!(!sink.push(&packet));
    }
}
