use ffmpeg_next::codec;

/// Codec identifiers as they appear on the wire, in the initial stream
/// descriptor. The device encodes them as big-endian FourCC values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CodecId {
    H264 = 0x68_32_36_34, // "h264"
    H265 = 0x68_32_36_35, // "h265"
    Av1 = 0x00_61_76_31,  // "av1"
    Opus = 0x6f_70_75_73, // "opus"
    Aac = 0x00_61_61_63,  // "aac"
    Flac = 0x66_6c_61_63, // "flac"
    Raw = 0x00_72_61_77,  // "raw"
}

impl CodecId {
    pub fn from_raw(raw: u32) -> Option<CodecId> {
        match raw {
            0x68_32_36_34 => Some(CodecId::H264),
            0x68_32_36_35 => Some(CodecId::H265),
            0x00_61_76_31 => Some(CodecId::Av1),
            0x6f_70_75_73 => Some(CodecId::Opus),
            0x00_61_61_63 => Some(CodecId::Aac),
            0x66_6c_61_63 => Some(CodecId::Flac),
            0x00_72_61_77 => Some(CodecId::Raw),
            _ => None,
        }
    }

    pub fn to_ffmpeg(self) -> codec::Id {
        match self {
            CodecId::H264 => codec::Id::H264,
            CodecId::H265 => codec::Id::HEVC,
            CodecId::Av1 => codec::Id::AV1,
            CodecId::Opus => codec::Id::OPUS,
            CodecId::Aac => codec::Id::AAC,
            CodecId::Flac => codec::Id::FLAC,
            CodecId::Raw => codec::Id::PCM_S16LE,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265 | CodecId::Av1)
    }

    /// Whether the elementary stream starts with a standalone config packet
    /// carrying the decoder extradata.
    pub fn expects_config_packet(self) -> bool {
        !matches!(self, CodecId::Raw)
    }
}

/// Which of the two elementary streams a component belongs to. Mostly
/// used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

/// Produced once per logical stream, pushed down every sink chain before
/// any packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSession {
    pub codec_id: CodecId,
    /// Frame size, for video streams only.
    pub video_size: Option<(u32, u32)>,
}

impl StreamSession {
    pub fn video(codec_id: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec_id,
            video_size: Some((width, height)),
        }
    }

    pub fn audio(codec_id: CodecId) -> Self {
        Self {
            codec_id,
            video_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_id_round_trip() {
        for id in [
            CodecId::H264,
            CodecId::H265,
            CodecId::Av1,
            CodecId::Opus,
            CodecId::Aac,
            CodecId::Flac,
            CodecId::Raw,
        ] {
            assert_eq!(CodecId::from_raw(id as u32), Some(id));
        }
    }

    #[test]
    fn test_unknown_codec_id() {
        assert_eq!(CodecId::from_raw(0), None);
        assert_eq!(CodecId::from_raw(0xdead_beef), None);
    }

    #[test]
    fn test_video_flag() {
        assert!(CodecId::H264.is_video());
        assert!(CodecId::Av1.is_video());
        assert!(!CodecId::Opus.is_video());
    }
}
