use std::sync::Arc;

use ffmpeg_next::Packet;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format;

use crate::frame::SharedFrame;
use crate::session::StreamSession;

/// Decoded stream parameters, known once the decoder is opened. Frame
/// sinks receive them on open so they can size their own machinery.
#[derive(Debug, Clone, Copy)]
pub enum CodecParams {
    Video {
        width: u32,
        height: u32,
    },
    Audio {
        sample_rate: u32,
        channel_layout: ChannelLayout,
        sample_format: format::Sample,
    },
}

/// A stage consuming encoded packets.
///
/// All operations report failure by returning `false`; the producer owns
/// the reaction (the demuxer terminates on the first failing sink).
pub trait PacketSink: Send + Sync {
    fn open(&self, session: &StreamSession) -> bool;

    fn close(&self);

    /// The packet is only borrowed for the duration of the call; a sink
    /// that keeps it must take its own reference.
    fn push(&self, packet: &Packet) -> bool;

    fn push_session(&self, session: &StreamSession) -> bool {
        let _ = session;
        true
    }

    /// The producer learnt at runtime that this stream will never start.
    /// Distinct from EOS: `open` was never called.
    fn disable(&self) {}
}

/// A stage consuming decoded frames.
pub trait FrameSink: Send + Sync {
    fn open(&self, params: &CodecParams, session: &StreamSession) -> bool;

    fn close(&self);

    fn push(&self, frame: &SharedFrame) -> bool;

    fn push_session(&self, session: &StreamSession) -> bool {
        let _ = session;
        true
    }
}

pub const MAX_SINKS: usize = 2;

/// Fan-out of packets to a fixed set of sinks. Sinks are opened in
/// registration order and closed in reverse; a partial open is rolled
/// back.
#[derive(Default)]
pub struct PacketSource {
    sinks: heapless::Vec<Arc<dyn PacketSink>, MAX_SINKS>,
}

impl PacketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn PacketSink>) {
        self.sinks
            .push(sink)
            .unwrap_or_else(|_| panic!("too many packet sinks"));
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn open(&self, session: &StreamSession) -> bool {
        for (i, sink) in self.sinks.iter().enumerate() {
            if !sink.open(session) {
                log::error!("Could not open packet sink {i}");
                for opened in self.sinks[..i].iter().rev() {
                    opened.close();
                }
                return false;
            }
        }

        true
    }

    pub fn close(&self) {
        for sink in self.sinks.iter().rev() {
            sink.close();
        }
    }

    pub fn push(&self, packet: &Packet) -> bool {
        for (i, sink) in self.sinks.iter().enumerate() {
            if !sink.push(packet) {
                log::error!("Could not push packet to sink {i}");
                return false;
            }
        }

        true
    }

    pub fn push_session(&self, session: &StreamSession) -> bool {
        for sink in self.sinks.iter() {
            if !sink.push_session(session) {
                return false;
            }
        }

        true
    }

    pub fn disable(&self) {
        for sink in self.sinks.iter() {
            sink.disable();
        }
    }
}

/// Fan-out of frames, same contract as [`PacketSource`].
#[derive(Default)]
pub struct FrameSource {
    sinks: heapless::Vec<Arc<dyn FrameSink>, MAX_SINKS>,
}

impl FrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn FrameSink>) {
        self.sinks
            .push(sink)
            .unwrap_or_else(|_| panic!("too many frame sinks"));
    }

    pub fn open(&self, params: &CodecParams, session: &StreamSession) -> bool {
        for (i, sink) in self.sinks.iter().enumerate() {
            if !sink.open(params, session) {
                log::error!("Could not open frame sink {i}");
                for opened in self.sinks[..i].iter().rev() {
                    opened.close();
                }
                return false;
            }
        }

        true
    }

    pub fn close(&self) {
        for sink in self.sinks.iter().rev() {
            sink.close();
        }
    }

    pub fn push(&self, frame: &SharedFrame) -> bool {
        for (i, sink) in self.sinks.iter().enumerate() {
            if !sink.push(frame) {
                log::error!("Could not push frame to sink {i}");
                return false;
            }
        }

        true
    }

    pub fn push_session(&self, session: &StreamSession) -> bool {
        for sink in self.sinks.iter() {
            if !sink.push_session(session) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CodecId;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        fail_open: bool,
        fail_push: bool,
        opened: AtomicUsize,
        closed: AtomicUsize,
        pushed: AtomicUsize,
        log: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    impl PacketSink for RecordingSink {
        fn open(&self, _session: &StreamSession) -> bool {
            if self.fail_open {
                return false;
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name);
            true
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name);
        }

        fn push(&self, _packet: &Packet) -> bool {
            if self.fail_push {
                return false;
            }
            self.pushed.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn session() -> StreamSession {
        StreamSession::audio(CodecId::Opus)
    }

    #[test]
    fn test_open_rollback_on_partial_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(RecordingSink {
            name: "first",
            log: log.clone(),
            ..Default::default()
        });
        let second = Arc::new(RecordingSink {
            name: "second",
            fail_open: true,
            log: log.clone(),
            ..Default::default()
        });

        let mut source = PacketSource::new();
        source.add_sink(first.clone());
        source.add_sink(second);

        assert!(!source.open(&session()));
        // the sink opened before the failure is closed again
        assert_eq!(first.opened.load(Ordering::SeqCst), 1);
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(RecordingSink {
            name: "first",
            log: log.clone(),
            ..Default::default()
        });
        let second = Arc::new(RecordingSink {
            name: "second",
            log: log.clone(),
            ..Default::default()
        });

        let mut source = PacketSource::new();
        source.add_sink(first);
        source.add_sink(second);

        assert!(source.open(&session()));
        source.close();

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "second", "second", "first"]);
    }

    #[test]
    fn test_push_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(RecordingSink {
            name: "failing",
            fail_push: true,
            log: log.clone(),
            ..Default::default()
        });
        let last = Arc::new(RecordingSink {
            name: "last",
            log,
            ..Default::default()
        });

        let mut source = PacketSource::new();
        source.add_sink(failing);
        source.add_sink(last.clone());

        assert!(source.open(&session()));
        let packet = Packet::copy(&[0u8; 4]);
        assert!(!source.push(&packet));
        // sinks after the failing one are not reached
        assert_eq!(last.pushed.load(Ordering::SeqCst), 0);
    }
}
