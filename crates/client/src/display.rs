use std::sync::Mutex;

use crossbeam::channel::Sender;

use media::frame::SharedFrame;
use media::session::StreamSession;
use media::sink::{CodecParams, FrameSink};

use crate::events::AppEvent;

struct WellState {
    pending: Option<SharedFrame>,
    open: bool,
}

/// Terminal frame consumer: a single pending-frame slot plus a wake-up
/// event.
///
/// The decoder thread deposits frames here; the main loop picks them up
/// at its own pace. Older frames are always dropped in favour of the
/// latest, and the wake-up is only posted when the slot was empty, so a
/// slow consumer never accumulates a backlog of events.
pub struct FrameWell {
    state: Mutex<WellState>,
    events: Sender<AppEvent>,
}

impl FrameWell {
    pub fn new(events: Sender<AppEvent>) -> Self {
        Self {
            state: Mutex::new(WellState {
                pending: None,
                open: false,
            }),
            events,
        }
    }

    /// Take the latest pending frame, if any.
    pub fn take_frame(&self) -> Option<SharedFrame> {
        self.state.lock().unwrap().pending.take()
    }
}

impl FrameSink for FrameWell {
    fn open(&self, _params: &CodecParams, _session: &StreamSession) -> bool {
        let mut state = self.state.lock().unwrap();
        state.open = true;
        state.pending = None;
        true
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.pending = None;
    }

    fn push(&self, frame: &SharedFrame) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return false;
        }

        let was_empty = state.pending.replace(frame.clone()).is_none();
        drop(state);

        if was_empty {
            // A pending frame already implies a queued wake-up
            let _ = self.events.send(AppEvent::FrameAvailable);
        }

        true
    }

    fn push_session(&self, session: &StreamSession) -> bool {
        let _ = self.events.send(AppEvent::SessionChanged(*session));
        true
    }
}
