use bytes::Buf;
use thiserror::Error;

const TYPE_CLIPBOARD: u8 = 0;
const TYPE_ACK_CLIPBOARD: u8 = 1;
const TYPE_UHID_OUTPUT: u8 = 2;

/// Messages sent by the device on the control socket (reverse
/// direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMsg {
    /// The device clipboard changed.
    Clipboard(String),
    /// A SetClipboard request up to this sequence has been applied.
    AckClipboard(u64),
    /// HID output report from a UHID device (e.g. keyboard LED state).
    UhidOutput { id: u16, data: Vec<u8> },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown device message type {0}")]
    UnknownType(u8),
    #[error("device message is not valid UTF-8")]
    InvalidText,
}

impl DeviceMsg {
    /// Try to parse one message from the start of `data`.
    ///
    /// Returns the message and the number of consumed bytes, or `None`
    /// when the buffer does not hold a complete message yet.
    pub fn parse(data: &[u8]) -> Result<Option<(DeviceMsg, usize)>, ParseError> {
        if data.is_empty() {
            return Ok(None);
        }

        let mut buf = &data[1..];
        match data[0] {
            TYPE_CLIPBOARD => {
                if buf.remaining() < 4 {
                    return Ok(None);
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Ok(None);
                }
                let text = std::str::from_utf8(&buf[..len])
                    .map_err(|_| ParseError::InvalidText)?
                    .to_owned();
                Ok(Some((DeviceMsg::Clipboard(text), 5 + len)))
            }
            TYPE_ACK_CLIPBOARD => {
                if buf.remaining() < 8 {
                    return Ok(None);
                }
                Ok(Some((DeviceMsg::AckClipboard(buf.get_u64()), 9)))
            }
            TYPE_UHID_OUTPUT => {
                if buf.remaining() < 4 {
                    return Ok(None);
                }
                let id = buf.get_u16();
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Ok(None);
                }
                let data = buf[..len].to_vec();
                Ok(Some((DeviceMsg::UhidOutput { id, data }, 5 + len)))
            }
            other => Err(ParseError::UnknownType(other)),
        }
    }
}
