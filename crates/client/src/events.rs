use crossbeam::channel::{self, Receiver, Sender};

use media::demuxer::DemuxerStatus;
use media::session::{StreamKind, StreamSession};

/// Typed events posted by the pipeline threads to the main loop.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A demuxer terminated (EOS, disabled stream or error).
    DemuxerEnded {
        kind: StreamKind,
        status: DemuxerStatus,
    },
    /// The recorder finished, successfully or not.
    RecorderEnded(bool),
    /// The control socket failed; input cannot reach the device anymore.
    ControllerError,
    /// A new decoded frame is pending in the frame well.
    FrameAvailable,
    /// The video stream was reconfigured (rotation, resize).
    SessionChanged(StreamSession),
}

/// Single consumer event hub between the pipeline and the main loop.
pub struct EventHub {
    tx: Sender<AppEvent>,
    rx: Receiver<AppEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<AppEvent> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> &Receiver<AppEvent> {
        &self.rx
    }
}
