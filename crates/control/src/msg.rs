use bytes::{BufMut, BytesMut};

use mirror_common::binary::{f32_to_i16fp, f32_to_u16fp};

/// Hard limit on a serialised message, guaranteed by construction.
pub const CONTROL_MSG_MAX_SIZE: usize = 1 << 18; // 256k

pub const INJECT_TEXT_MAX_LENGTH: usize = 300;
// type: 1 byte; sequence: 8 bytes; paste flag: 1 byte; length: 4 bytes
pub const CLIPBOARD_TEXT_MAX_LENGTH: usize = CONTROL_MSG_MAX_SIZE - 14;

/// android.view.MotionEvent#ACTION_MOVE
const MOTION_EVENT_ACTION_MOVE: u8 = 2;

const TYPE_INJECT_KEYCODE: u8 = 0;
const TYPE_INJECT_TEXT: u8 = 1;
const TYPE_INJECT_TOUCH_EVENT: u8 = 2;
const TYPE_INJECT_SCROLL_EVENT: u8 = 3;
const TYPE_BACK_OR_SCREEN_ON: u8 = 4;
const TYPE_EXPAND_NOTIFICATION_PANEL: u8 = 5;
const TYPE_EXPAND_SETTINGS_PANEL: u8 = 6;
const TYPE_COLLAPSE_PANELS: u8 = 7;
const TYPE_GET_CLIPBOARD: u8 = 8;
const TYPE_SET_CLIPBOARD: u8 = 9;
const TYPE_SET_DISPLAY_POWER: u8 = 10;
const TYPE_ROTATE_DEVICE: u8 = 11;
const TYPE_UHID_CREATE: u8 = 12;
const TYPE_UHID_INPUT: u8 = 13;
const TYPE_UHID_DESTROY: u8 = 14;
const TYPE_OPEN_HARD_KEYBOARD_SETTINGS: u8 = 15;
const TYPE_START_APP: u8 = 16;
const TYPE_RESET_VIDEO: u8 = 17;

/// A point on the device screen, together with the screen size it was
/// computed against (the device rescales if its resolution changed in
/// between).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub screen_width: u16,
    pub screen_height: u16,
}

impl Position {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(self.x);
        buf.put_i32(self.y);
        buf.put_u16(self.screen_width);
        buf.put_u16(self.screen_height);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyKey {
    None = 0,
    Copy = 1,
    Cut = 2,
}

/// Messages sent to the device over the control socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMsg {
    InjectKeycode {
        action: u8,
        keycode: u32,
        repeat: u32,
        metastate: u32,
    },
    InjectText {
        text: String,
    },
    InjectTouchEvent {
        action: u8,
        pointer_id: u64,
        position: Position,
        pressure: f32,
        action_button: u32,
        buttons: u32,
    },
    InjectScrollEvent {
        position: Position,
        hscroll: f32,
        vscroll: f32,
        buttons: u32,
    },
    BackOrScreenOn {
        action: u8,
    },
    ExpandNotificationPanel,
    ExpandSettingsPanel,
    CollapsePanels,
    GetClipboard {
        copy_key: CopyKey,
    },
    SetClipboard {
        sequence: u64,
        paste: bool,
        text: String,
    },
    SetDisplayPower {
        on: bool,
    },
    RotateDevice,
    UhidCreate {
        id: u16,
        vendor_id: u16,
        product_id: u16,
        name: String,
        report_desc: Vec<u8>,
    },
    UhidInput {
        id: u16,
        data: Vec<u8>,
    },
    UhidDestroy {
        id: u16,
    },
    OpenHardKeyboardSettings,
    StartApp {
        name: String,
    },
    ResetVideo,
}

/// Truncate to at most `max` bytes without splitting a code point.
fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl ControlMsg {
    /// Serialise in network byte order. The output length is bounded by
    /// [`CONTROL_MSG_MAX_SIZE`].
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            ControlMsg::InjectKeycode {
                action,
                keycode,
                repeat,
                metastate,
            } => {
                buf.put_u8(TYPE_INJECT_KEYCODE);
                buf.put_u8(*action);
                buf.put_u32(*keycode);
                buf.put_u32(*repeat);
                buf.put_u32(*metastate);
            }
            ControlMsg::InjectText { text } => {
                buf.put_u8(TYPE_INJECT_TEXT);
                let text = truncate_utf8(text, INJECT_TEXT_MAX_LENGTH);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMsg::InjectTouchEvent {
                action,
                pointer_id,
                position,
                pressure,
                action_button,
                buttons,
            } => {
                buf.put_u8(TYPE_INJECT_TOUCH_EVENT);
                buf.put_u8(*action);
                buf.put_u64(*pointer_id);
                position.write(buf);
                buf.put_u16(f32_to_u16fp(*pressure));
                buf.put_u32(*action_button);
                buf.put_u32(*buttons);
            }
            ControlMsg::InjectScrollEvent {
                position,
                hscroll,
                vscroll,
                buttons,
            } => {
                buf.put_u8(TYPE_INJECT_SCROLL_EVENT);
                position.write(buf);
                buf.put_i16(f32_to_i16fp(*hscroll));
                buf.put_i16(f32_to_i16fp(*vscroll));
                buf.put_u32(*buttons);
            }
            ControlMsg::BackOrScreenOn { action } => {
                buf.put_u8(TYPE_BACK_OR_SCREEN_ON);
                buf.put_u8(*action);
            }
            ControlMsg::ExpandNotificationPanel => buf.put_u8(TYPE_EXPAND_NOTIFICATION_PANEL),
            ControlMsg::ExpandSettingsPanel => buf.put_u8(TYPE_EXPAND_SETTINGS_PANEL),
            ControlMsg::CollapsePanels => buf.put_u8(TYPE_COLLAPSE_PANELS),
            ControlMsg::GetClipboard { copy_key } => {
                buf.put_u8(TYPE_GET_CLIPBOARD);
                buf.put_u8(*copy_key as u8);
            }
            ControlMsg::SetClipboard {
                sequence,
                paste,
                text,
            } => {
                buf.put_u8(TYPE_SET_CLIPBOARD);
                buf.put_u64(*sequence);
                buf.put_u8(*paste as u8);
                let text = truncate_utf8(text, CLIPBOARD_TEXT_MAX_LENGTH);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMsg::SetDisplayPower { on } => {
                buf.put_u8(TYPE_SET_DISPLAY_POWER);
                buf.put_u8(*on as u8);
            }
            ControlMsg::RotateDevice => buf.put_u8(TYPE_ROTATE_DEVICE),
            ControlMsg::UhidCreate {
                id,
                vendor_id,
                product_id,
                name,
                report_desc,
            } => {
                buf.put_u8(TYPE_UHID_CREATE);
                buf.put_u16(*id);
                buf.put_u16(*vendor_id);
                buf.put_u16(*product_id);
                let name = truncate_utf8(name, u8::MAX as usize);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(report_desc.len() as u16);
                buf.put_slice(report_desc);
            }
            ControlMsg::UhidInput { id, data } => {
                buf.put_u8(TYPE_UHID_INPUT);
                buf.put_u16(*id);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            ControlMsg::UhidDestroy { id } => {
                buf.put_u8(TYPE_UHID_DESTROY);
                buf.put_u16(*id);
            }
            ControlMsg::OpenHardKeyboardSettings => buf.put_u8(TYPE_OPEN_HARD_KEYBOARD_SETTINGS),
            ControlMsg::StartApp { name } => {
                buf.put_u8(TYPE_START_APP);
                let name = truncate_utf8(name, u8::MAX as usize);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            ControlMsg::ResetVideo => buf.put_u8(TYPE_RESET_VIDEO),
        }
    }

    /// Whether this message may be silently discarded when the outgoing
    /// queue is full. Continuous motion can be sacrificed, state changes
    /// cannot.
    pub fn is_droppable(&self) -> bool {
        match self {
            ControlMsg::InjectTouchEvent { action, .. } => *action == MOTION_EVENT_ACTION_MOVE,
            ControlMsg::InjectScrollEvent { .. } => true,
            _ => false,
        }
    }
}
