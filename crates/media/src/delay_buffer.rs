use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use mirror_common::Tick;

use crate::clock::Clock;
use crate::frame::SharedFrame;
use crate::session::StreamSession;
use crate::sink::{CodecParams, FrameSink, FrameSource};

enum DelayedItem {
    Frame(SharedFrame),
    Session(StreamSession),
}

struct State {
    queue: VecDeque<DelayedItem>,
    clock: Clock,
    stopped: bool,
}

struct Inner {
    delay: Tick,
    source: FrameSource,
    state: Mutex<State>,
    /// Signalled when an item is enqueued or on stop.
    queue_cond: Condvar,
    /// Signalled on clock updates and on stop, so a sleeping release can
    /// re-evaluate its deadline.
    wait_cond: Condvar,
}

/// Holds each frame for a fixed wall-clock delay so that consumers see
/// frames at a stable offset from their capture time, absorbing network
/// jitter.
///
/// The release deadline of a frame is `clock(pts) + delay`, capped by
/// `now + delay`: during startup the clock estimate may be wildly off,
/// and an uncapped deadline could stall the pipeline. Once the clock has
/// converged the cap stops firing.
pub struct DelayBuffer {
    first_frame_asap: bool,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayBuffer {
    /// `first_frame_asap` releases the very first frame immediately, so a
    /// window can paint as soon as possible.
    pub fn new(delay: Tick, first_frame_asap: bool) -> Self {
        assert!(delay > Tick::ZERO);

        Self {
            first_frame_asap,
            inner: Arc::new(Inner {
                delay,
                source: FrameSource::new(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    clock: Clock::new(),
                    stopped: false,
                }),
                queue_cond: Condvar::new(),
                wait_cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Sinks must be registered before the buffer is shared.
    pub fn add_sink(&mut self, sink: Arc<dyn FrameSink>) {
        Arc::get_mut(&mut self.inner)
            .expect("sinks must be added before the delay buffer is started")
            .source
            .add_sink(sink);
    }
}

fn run_buffering(inner: Arc<Inner>) {
    loop {
        let item = {
            let mut state = inner.state.lock().unwrap();

            while !state.stopped && state.queue.is_empty() {
                state = inner.queue_cond.wait(state).unwrap();
            }

            if state.stopped {
                break;
            }

            let item = state.queue.pop_front().unwrap();

            if let DelayedItem::Frame(frame) = &item {
                let max_deadline = Tick::now() + inner.delay;
                let pts = Tick::from_micros(frame.pts().unwrap_or(0));

                let mut timed_out = false;
                while !state.stopped && !timed_out {
                    // Recomputed on every wakeup: the clock improves as
                    // new frames arrive.
                    let mut deadline = max_deadline;
                    if state.clock.count() >= 2 {
                        let estimated = state.clock.to_system_time(pts) + inner.delay;
                        if estimated < deadline {
                            deadline = estimated;
                        }
                    }

                    match deadline.time_until() {
                        Some(timeout) => {
                            let (guard, wait) =
                                inner.wait_cond.wait_timeout(state, timeout).unwrap();
                            state = guard;
                            timed_out = wait.timed_out();
                        }
                        None => timed_out = true,
                    }
                }

                if state.stopped {
                    break;
                }
            }

            item
        };

        // Pushed without holding the lock
        let ok = match &item {
            DelayedItem::Frame(frame) => inner.source.push(frame),
            DelayedItem::Session(session) => inner.source.push_session(session),
        };

        if !ok {
            log::error!("Delayed frame could not be pushed, stopping");
            let mut state = inner.state.lock().unwrap();
            // Prevent any new push
            state.stopped = true;
            break;
        }
    }

    // Flush the queue
    let mut state = inner.state.lock().unwrap();
    state.queue.clear();

    log::debug!("Buffering thread ended");
}

impl FrameSink for DelayBuffer {
    fn open(&self, params: &CodecParams, session: &StreamSession) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped = false;
            state.queue.clear();
            state.clock = Clock::new();
        }

        if !self.inner.source.open(params, session) {
            return false;
        }

        let inner = self.inner.clone();
        *self.worker.lock().unwrap() = Some(thread::spawn(move || run_buffering(inner)));

        true
    }

    fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped = true;
            self.inner.queue_cond.notify_all();
            self.inner.wait_cond.notify_all();
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        self.inner.source.close();
    }

    fn push(&self, frame: &SharedFrame) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        if state.stopped {
            return false;
        }

        let pts = Tick::from_micros(frame.pts().unwrap_or(0));
        state.clock.update(Tick::now(), pts);
        self.inner.wait_cond.notify_all();

        if self.first_frame_asap && state.clock.count() == 1 {
            drop(state);
            return self.inner.source.push(frame);
        }

        state.queue.push_back(DelayedItem::Frame(frame.clone()));
        self.inner.queue_cond.notify_all();

        true
    }

    fn push_session(&self, session: &StreamSession) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        if state.stopped {
            return false;
        }

        state.queue.push_back(DelayedItem::Session(*session));
        self.inner.queue_cond.notify_all();

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CodecId;
    use ffmpeg_next::util::channel_layout::ChannelLayout;
    use ffmpeg_next::util::format;
    use ffmpeg_next::util::frame;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CollectSink {
        items: StdMutex<Vec<(Option<i64>, Instant)>>,
        sessions: StdMutex<Vec<StreamSession>>,
    }

    impl FrameSink for CollectSink {
        fn open(&self, _: &CodecParams, _: &StreamSession) -> bool {
            true
        }

        fn close(&self) {}

        fn push(&self, frame: &SharedFrame) -> bool {
            self.items
                .lock()
                .unwrap()
                .push((frame.pts(), Instant::now()));
            true
        }

        fn push_session(&self, session: &StreamSession) -> bool {
            self.sessions.lock().unwrap().push(*session);
            true
        }
    }

    fn frame_with_pts(pts: i64) -> SharedFrame {
        let mut frame = frame::Audio::new(
            format::Sample::F32(format::sample::Type::Packed),
            16,
            ChannelLayout::STEREO,
        );
        frame.set_pts(Some(pts));
        unsafe { SharedFrame::from_av(frame.as_ptr()) }.unwrap()
    }

    fn params() -> CodecParams {
        CodecParams::Audio {
            sample_rate: 48_000,
            channel_layout: ChannelLayout::STEREO,
            sample_format: format::Sample::F32(format::sample::Type::Packed),
        }
    }

    #[test]
    fn test_first_frame_asap_bypasses_delay() {
        let sink = Arc::new(CollectSink::default());
        let mut buffer = DelayBuffer::new(Tick::from_millis(500), true);
        buffer.add_sink(sink.clone());

        let session = StreamSession::audio(CodecId::Opus);
        assert!(buffer.open(&params(), &session));

        let start = Instant::now();
        assert!(buffer.push(&frame_with_pts(0)));
        // released synchronously, no 500 ms wait
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(sink.items.lock().unwrap().len(), 1);

        buffer.close();
    }

    #[test]
    fn test_frames_are_delayed_and_ordered() {
        let sink = Arc::new(CollectSink::default());
        let mut buffer = DelayBuffer::new(Tick::from_millis(40), false);
        buffer.add_sink(sink.clone());

        let session = StreamSession::audio(CodecId::Opus);
        assert!(buffer.open(&params(), &session));

        let start = Instant::now();
        let base = Tick::now().as_micros();
        assert!(buffer.push(&frame_with_pts(base)));
        assert!(buffer.push(&frame_with_pts(base + 20_000)));

        // Wait for both releases
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.items.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let items = sink.items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, Some(base));
        assert_eq!(items[1].0, Some(base + 20_000));
        // the first frame waited for (roughly) the configured delay
        assert!(start.elapsed() >= Duration::from_millis(30));
        drop(items);

        buffer.close();
    }

    #[test]
    fn test_sessions_keep_their_position_in_the_queue() {
        let sink = Arc::new(CollectSink::default());
        let mut buffer = DelayBuffer::new(Tick::from_millis(10), false);
        buffer.add_sink(sink.clone());

        let session = StreamSession::audio(CodecId::Opus);
        assert!(buffer.open(&params(), &session));

        let base = Tick::now().as_micros();
        assert!(buffer.push(&frame_with_pts(base)));
        let updated = StreamSession::audio(CodecId::Aac);
        assert!(buffer.push_session(&updated));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.sessions.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // the frame queued before the session was released first
        assert_eq!(sink.items.lock().unwrap().len(), 1);
        assert_eq!(sink.sessions.lock().unwrap()[0].codec_id, CodecId::Aac);

        buffer.close();
    }

    #[test]
    fn test_push_after_close_fails() {
        let sink = Arc::new(CollectSink::default());
        let mut buffer = DelayBuffer::new(Tick::from_millis(10), false);
        buffer.add_sink(sink);

        let session = StreamSession::audio(CodecId::Opus);
        assert!(buffer.open(&params(), &session));
        buffer.close();

        assert!(!buffer.push(&frame_with_pts(0)));
    }
}
