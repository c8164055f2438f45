use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Consumer of HID output reports for one UHID device.
///
/// The communication with UHID devices is bidirectional: input backends
/// create devices and send reports, the device answers with output
/// reports (a keyboard synchronising its LED/lock state, typically).
pub trait UhidEventSink: Send + Sync {
    fn process_output(&self, data: &[u8]);
}

/// Dispatches HID outputs to the sink registered under the device id.
#[derive(Default)]
pub struct UhidRegistry {
    sinks: Mutex<HashMap<u16, Arc<dyn UhidEventSink>>>,
}

impl UhidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u16, sink: Arc<dyn UhidEventSink>) {
        self.sinks.lock().unwrap().insert(id, sink);
    }

    pub fn unregister(&self, id: u16) {
        self.sinks.lock().unwrap().remove(&id);
    }

    pub fn process_output(&self, id: u16, data: &[u8]) {
        if data.is_empty() {
            // Do not trust the device
            log::error!("Unexpected empty HID output message");
            return;
        }

        let sink = self.sinks.lock().unwrap().get(&id).cloned();
        match sink {
            Some(sink) => sink.process_output(data),
            None => log::warn!("HID output ignored for unknown device id {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        outputs: Mutex<Vec<Vec<u8>>>,
        count: AtomicUsize,
    }

    impl UhidEventSink for RecordingSink {
        fn process_output(&self, data: &[u8]) {
            self.outputs.lock().unwrap().push(data.to_vec());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_routes_by_id() {
        let registry = UhidRegistry::new();
        let keyboard = Arc::new(RecordingSink::default());
        registry.register(1, keyboard.clone());

        registry.process_output(1, &[0x02]);
        registry.process_output(2, &[0xff]); // unknown id, ignored

        assert_eq!(*keyboard.outputs.lock().unwrap(), vec![vec![0x02]]);
    }

    #[test]
    fn test_empty_output_is_rejected() {
        let registry = UhidRegistry::new();
        let keyboard = Arc::new(RecordingSink::default());
        registry.register(1, keyboard.clone());

        registry.process_output(1, &[]);
        assert_eq!(keyboard.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister() {
        let registry = UhidRegistry::new();
        let keyboard = Arc::new(RecordingSink::default());
        registry.register(1, keyboard.clone());
        registry.unregister(1);

        registry.process_output(1, &[0x01]);
        assert_eq!(keyboard.count.load(Ordering::SeqCst), 0);
    }
}
