use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Buf;
use ffmpeg_next::Packet;
use ffmpeg_next::codec;

use crate::session::{CodecId, StreamKind, StreamSession};
use crate::sink::{PacketSink, PacketSource};

pub const PACKET_HEADER_SIZE: usize = 12;

const PACKET_FLAG_CONFIG: u64 = 1 << 63;
const PACKET_FLAG_KEY_FRAME: u64 = 1 << 62;
const PACKET_PTS_MASK: u64 = PACKET_FLAG_KEY_FRAME - 1;

/// How a demuxer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerStatus {
    /// Clean end of stream (device closed the socket, or stop requested
    /// by shutting the socket down).
    Eos,
    /// The device reported at runtime that this stream will never start
    /// (audio codec id 0).
    Disabled,
    /// Protocol violation, allocation failure or sink failure.
    Error,
}

/// Receives one framed elementary stream from the device and fans the
/// packets out to the registered sinks.
///
/// Each packet is preceded by a 12-byte header:
///
/// ```text
/// [. . . . . . . .|. . . .]. . . . . . . . . . . . ...
///  <-------------> <-----> <-----------------------...
///     PTS+flags     length          raw packet
/// ```
///
/// The two most significant bits of the first field carry the config and
/// key-frame flags; the low 62 bits carry the PTS in microseconds.
pub struct Demuxer<R> {
    kind: StreamKind,
    reader: R,
    source: PacketSource,
    /// Config packets are not playable on their own: their payload is
    /// retained here and prepended to the next data packet.
    pending: Vec<u8>,
}

enum Received {
    Packet { packet: Packet, is_config: bool },
    Eos,
    Corrupt,
}

impl<R: Read> Demuxer<R> {
    pub fn new(kind: StreamKind, reader: R) -> Self {
        Self {
            kind,
            reader,
            source: PacketSource::new(),
            pending: Vec::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn PacketSink>) {
        self.source.add_sink(sink);
    }

    fn read_session(&mut self) -> Result<Option<StreamSession>, DemuxerStatus> {
        let mut raw_id = [0u8; 4];
        if self.reader.read_exact(&mut raw_id).is_err() {
            return Err(DemuxerStatus::Eos);
        }
        let raw_id = u32::from_be_bytes(raw_id);

        if raw_id == 0 {
            return Ok(None);
        }

        let Some(codec_id) = CodecId::from_raw(raw_id) else {
            log::error!("Demuxer ({}): unknown codec id {raw_id:#010x}", self.kind.name());
            return Err(DemuxerStatus::Error);
        };

        if codec_id.is_video() != matches!(self.kind, StreamKind::Video) {
            log::error!(
                "Demuxer ({}): codec {codec_id:?} does not match the stream",
                self.kind.name()
            );
            return Err(DemuxerStatus::Error);
        }

        if codec_id.is_video() {
            let mut size = [0u8; 8];
            if self.reader.read_exact(&mut size).is_err() {
                return Err(DemuxerStatus::Eos);
            }
            let mut buf = &size[..];
            let width = buf.get_u32();
            let height = buf.get_u32();
            return Ok(Some(StreamSession::video(codec_id, width, height)));
        }

        Ok(Some(StreamSession::audio(codec_id)))
    }

    fn recv_packet(&mut self) -> Received {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        if self.reader.read_exact(&mut header).is_err() {
            // A short read is a disconnection, not a protocol error
            return Received::Eos;
        }

        let mut buf = &header[..];
        let pts_flags = buf.get_u64();
        let len = buf.get_u32() as usize;

        if len == 0 {
            log::error!("Demuxer ({}): empty packet", self.kind.name());
            return Received::Corrupt;
        }

        let mut packet = Packet::new(len);
        let data = packet.data_mut().expect("sized packet has data");
        if self.reader.read_exact(data).is_err() {
            return Received::Eos;
        }

        let is_config = pts_flags & PACKET_FLAG_CONFIG != 0;
        if !is_config {
            let pts = (pts_flags & PACKET_PTS_MASK) as i64;
            packet.set_pts(Some(pts));
            packet.set_dts(Some(pts));
        }
        if pts_flags & PACKET_FLAG_KEY_FRAME != 0 {
            packet.set_flags(codec::packet::Flags::KEY);
        }

        Received::Packet { packet, is_config }
    }

    /// Deliver a packet to the sinks. Config packets are never delivered
    /// on their own: their payload is held back and prepended to the next
    /// data packet.
    fn push_packet(&mut self, packet: Packet, is_config: bool) -> bool {
        if is_config {
            self.pending
                .extend_from_slice(packet.data().unwrap_or_default());
            return true;
        }

        if self.pending.is_empty() {
            return self.source.push(&packet);
        }

        let mut merged_data = std::mem::take(&mut self.pending);
        merged_data.extend_from_slice(packet.data().unwrap_or_default());

        let mut merged = Packet::copy(&merged_data);
        merged.set_pts(packet.pts());
        merged.set_dts(packet.dts());
        merged.set_flags(packet.flags());

        self.source.push(&merged)
    }

    fn run(&mut self) -> DemuxerStatus {
        let session = match self.read_session() {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::info!("Demuxer ({}): stream explicitly disabled by the device", self.kind.name());
                self.source.disable();
                return DemuxerStatus::Disabled;
            }
            Err(status) => return status,
        };

        log::debug!(
            "Demuxer ({}): starting stream, codec {:?}",
            self.kind.name(),
            session.codec_id
        );

        if !self.source.open(&session) {
            return DemuxerStatus::Error;
        }

        let status = loop {
            match self.recv_packet() {
                Received::Packet { packet, is_config } => {
                    if !self.push_packet(packet, is_config) {
                        break DemuxerStatus::Error;
                    }
                }
                Received::Eos => break DemuxerStatus::Eos,
                Received::Corrupt => break DemuxerStatus::Error,
            }
        };

        log::debug!("Demuxer ({}): end of packets", self.kind.name());

        self.source.close();

        status
    }
}

impl<R: Read + Send + 'static> Demuxer<R> {
    /// Spawn the reader thread. Stopping is done externally, by shutting
    /// down the underlying socket: the next read fails and the stream
    /// ends with [`DemuxerStatus::Eos`].
    pub fn start(
        mut self,
        on_ended: impl FnOnce(StreamKind, DemuxerStatus) + Send + 'static,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let status = self.run();
            on_ended(self.kind, status);
        })
    }
}
