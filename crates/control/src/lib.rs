pub mod acksync;
pub mod controller;
pub mod device_msg;
pub mod msg;
pub mod receiver;
pub mod uhid;

pub use acksync::{AckSync, WaitResult};
pub use controller::Controller;
pub use device_msg::DeviceMsg;
pub use msg::{ControlMsg, CopyKey, Position};
pub use uhid::{UhidEventSink, UhidRegistry};
