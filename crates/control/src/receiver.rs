use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::acksync::AckSync;
use crate::device_msg::DeviceMsg;
use crate::uhid::UhidRegistry;

/// Background reader of device-originated messages on the control
/// socket.
///
/// There is no explicit stop: shutting down the socket makes the read
/// fail and the thread exit. Clipboard content is published to the host
/// clipboard, acknowledgements release [`AckSync`] waiters, HID outputs
/// are routed to the registered device sinks.
pub struct Receiver {
    acksync: Arc<AckSync>,
    uhid: Arc<UhidRegistry>,
}

impl Receiver {
    pub fn new(acksync: Arc<AckSync>, uhid: Arc<UhidRegistry>) -> Self {
        Self { acksync, uhid }
    }

    pub fn start<R: Read + Send + 'static>(self, reader: R) -> JoinHandle<()> {
        thread::spawn(move || {
            self.run(reader);
            log::debug!("Receiver thread ended");
        })
    }

    fn run<R: Read>(&self, mut reader: R) {
        let mut clipboard: Option<arboard::Clipboard> = None;
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            buf.extend_from_slice(&chunk[..read]);

            let mut consumed = 0;
            loop {
                match DeviceMsg::parse(&buf[consumed..]) {
                    Ok(Some((msg, len))) => {
                        consumed += len;
                        self.process(msg, &mut clipboard);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::error!("Could not parse device message: {err}");
                        return;
                    }
                }
            }
            buf.drain(..consumed);
        }
    }

    fn process(&self, msg: DeviceMsg, clipboard: &mut Option<arboard::Clipboard>) {
        match msg {
            DeviceMsg::Clipboard(text) => {
                log::info!("Device clipboard copied ({} bytes)", text.len());
                if clipboard.is_none() {
                    match arboard::Clipboard::new() {
                        Ok(cb) => *clipboard = Some(cb),
                        Err(err) => {
                            log::warn!("Could not access the host clipboard: {err}");
                            return;
                        }
                    }
                }
                if let Some(cb) = clipboard {
                    if let Err(err) = cb.set_text(text) {
                        log::warn!("Could not set the host clipboard: {err}");
                    }
                }
            }
            DeviceMsg::AckClipboard(sequence) => {
                log::debug!("Ack device clipboard sequence={sequence}");
                self.acksync.ack(sequence);
            }
            DeviceMsg::UhidOutput { id, data } => {
                self.uhid.process_output(id, &data);
            }
        }
    }
}
