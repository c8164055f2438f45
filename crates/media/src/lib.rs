pub mod audiobuf;
pub mod clock;
pub mod decoder;
pub mod delay_buffer;
pub mod demuxer;
pub mod frame;
pub mod player;
pub mod recorder;
pub mod regulator;
pub mod session;
pub mod sink;

pub use frame::SharedFrame;
pub use session::{CodecId, StreamKind, StreamSession};
pub use sink::{CodecParams, FrameSink, FrameSource, PacketSink, PacketSource};
