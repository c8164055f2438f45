use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::acksync::AckSync;
use crate::msg::ControlMsg;
use crate::receiver::Receiver;
use crate::uhid::UhidRegistry;

/// Bound of the outgoing queue. Overflow policy depends on the message:
/// droppable ones are discarded, the others block (bounded) for a slot.
pub const QUEUE_CAPACITY: usize = 64;

/// How long a non-droppable message may wait for a queue slot.
const PUSH_WAIT: Duration = Duration::from_millis(200);

struct State {
    queue: VecDeque<ControlMsg>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Queue went non-empty (or stop).
    msg_cond: Condvar,
    /// A slot was freed by the writer.
    drain_cond: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                stopped: false,
            }),
            msg_cond: Condvar::new(),
            drain_cond: Condvar::new(),
        }
    }

    fn push(&self, msg: ControlMsg) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.stopped {
            return false;
        }

        if state.queue.len() >= QUEUE_CAPACITY {
            if msg.is_droppable() {
                // Continuous motion: losing one event is harmless
                log::debug!("Controller queue full, dropping message");
                return true;
            }

            // State changes must not be lost, wait (bounded) for a slot
            let deadline = Instant::now() + PUSH_WAIT;
            while !state.stopped && state.queue.len() >= QUEUE_CAPACITY {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .drain_cond
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = guard;
            }

            if state.stopped {
                return false;
            }
            if state.queue.len() >= QUEUE_CAPACITY {
                log::warn!("Controller queue still full, message rejected");
                return false;
            }
        }

        state.queue.push_back(msg);
        self.msg_cond.notify_all();

        true
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.msg_cond.notify_all();
        self.drain_cond.notify_all();
    }
}

fn run_writer<W: Write>(shared: &Shared, mut socket: W, on_error: &(dyn Fn() + Send + Sync)) {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let msg = {
            let mut state = shared.state.lock().unwrap();

            while !state.stopped && state.queue.is_empty() {
                state = shared.msg_cond.wait(state).unwrap();
            }

            if state.stopped {
                return;
            }

            let msg = state.queue.pop_front().unwrap();
            shared.drain_cond.notify_all();
            msg
        };

        log::trace!("Sending {msg:?}");

        buf.clear();
        msg.serialize(&mut buf);

        // write_all resumes on short writes
        if let Err(err) = socket.write_all(&buf) {
            log::error!("Could not write control message: {err}");
            shared.stop();
            on_error();
            return;
        }
    }
}

/// Owns the control socket: serialises queued [`ControlMsg`]s on a
/// dedicated writer thread and runs the embedded [`Receiver`] for the
/// device-originated replies.
pub struct Controller {
    socket: TcpStream,
    shared: Arc<Shared>,
    acksync: Arc<AckSync>,
    uhid: Arc<UhidRegistry>,
    writer: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            shared: Arc::new(Shared::new()),
            acksync: Arc::new(AckSync::new()),
            uhid: Arc::new(UhidRegistry::new()),
            writer: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    /// Sequence ordering primitive shared with the input layer.
    pub fn acksync(&self) -> Arc<AckSync> {
        self.acksync.clone()
    }

    pub fn uhid_registry(&self) -> Arc<UhidRegistry> {
        self.uhid.clone()
    }

    /// Spawn the writer and receiver threads. `on_error` is invoked if
    /// the control socket write fails.
    pub fn start(&self, on_error: impl Fn() + Send + Sync + 'static) -> io::Result<()> {
        let writer_socket = self.socket.try_clone()?;
        let shared = self.shared.clone();
        *self.writer.lock().unwrap() = Some(thread::spawn(move || {
            run_writer(&shared, writer_socket, &on_error);
            log::debug!("Controller thread ended");
        }));

        let receiver_socket = self.socket.try_clone()?;
        let receiver = Receiver::new(self.acksync.clone(), self.uhid.clone());
        *self.receiver.lock().unwrap() = Some(receiver.start(receiver_socket));

        Ok(())
    }

    pub fn push_msg(&self, msg: ControlMsg) -> bool {
        self.shared.push(msg)
    }

    pub fn stop(&self) {
        self.shared.stop();
        self.acksync.interrupt();
        // Cancels the receiver read and any pending write
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    pub fn join(&self) {
        if let Some(writer) = self.writer.lock().unwrap().take() {
            let _ = writer.join();
        }
        if let Some(receiver) = self.receiver.lock().unwrap().take() {
            let _ = receiver.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn key_msg(keycode: u32) -> ControlMsg {
        ControlMsg::InjectKeycode {
            action: 1,
            keycode,
            repeat: 0,
            metastate: 0x41,
        }
    }

    fn scroll_msg() -> ControlMsg {
        ControlMsg::InjectScrollEvent {
            position: crate::msg::Position {
                x: 0,
                y: 0,
                screen_width: 1,
                screen_height: 1,
            },
            hscroll: 0.0,
            vscroll: 1.0,
            buttons: 0,
        }
    }

    #[test]
    fn test_full_queue_drops_droppable_without_blocking() {
        let shared = Shared::new();
        for _ in 0..QUEUE_CAPACITY {
            assert!(shared.push(key_msg(1)));
        }

        let start = Instant::now();
        assert!(shared.push(scroll_msg()));
        assert!(start.elapsed() < PUSH_WAIT);

        // silently discarded: the queue did not grow
        assert_eq!(shared.state.lock().unwrap().queue.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn test_full_queue_times_out_for_non_droppable() {
        let shared = Shared::new();
        for _ in 0..QUEUE_CAPACITY {
            assert!(shared.push(key_msg(1)));
        }

        let start = Instant::now();
        assert!(!shared.push(key_msg(2)));
        assert!(start.elapsed() >= PUSH_WAIT);
    }

    #[test]
    fn test_non_droppable_enqueued_when_a_slot_frees() {
        let shared = Arc::new(Shared::new());
        for _ in 0..QUEUE_CAPACITY {
            assert!(shared.push(key_msg(1)));
        }

        let drainer = {
            let shared = shared.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let mut state = shared.state.lock().unwrap();
                state.queue.pop_front();
                shared.drain_cond.notify_all();
            })
        };

        assert!(shared.push(key_msg(2)));
        drainer.join().unwrap();
    }

    #[test]
    fn test_push_after_stop_fails() {
        let shared = Shared::new();
        shared.stop();
        assert!(!shared.push(key_msg(1)));
    }

    #[test]
    fn test_messages_are_written_in_push_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let controller = Controller::new(client);
        controller.start(|| {}).unwrap();

        assert!(controller.push_msg(key_msg(66)));
        assert!(controller.push_msg(ControlMsg::RotateDevice));

        let mut bytes = [0u8; 15];
        server.read_exact(&mut bytes).unwrap();
        assert_eq!(
            bytes,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x41, 0x0b]
        );

        controller.stop();
        controller.join();
    }
}
