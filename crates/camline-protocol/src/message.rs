//! Decoded message model: kinds, payload variants, and the message itself.

use serde_json::Value;

/// Message kind selector.
///
/// Non-negative values appear on the wire; negative values are synthetic
/// lifecycle events emitted locally by the session engine and never encoded
/// into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    /// Login handshake completed (synthetic).
    LoginComplete = -7,
    /// Full tag bulk-list merged for the first time this connection (synthetic).
    TagsLoaded = -6,
    /// Connection lost or closed (synthetic).
    Disconnected = -5,
    /// Full roster bulk-list merged for the first time this connection (synthetic).
    ModelsLoaded = -4,
    /// Socket established (synthetic).
    Connected = -3,
    /// Wildcard: handlers registered here receive every message (synthetic).
    Any = -2,
    /// Wire kind not present in the constant table (synthetic).
    Unknown = -1,

    Null = 0,
    Login = 1,
    AddFriend = 2,
    Pmesg = 3,
    Status = 4,
    Details = 5,
    TokenInc = 6,
    AddIgnore = 7,
    Logout = 8,
    DelFriend = 9,
    DelIgnore = 10,
    BanChan = 11,
    ForceChat = 12,
    GlobalMsg = 13,
    EventMsg = 14,
    StateDump = 15,
    Tkx = 16,
    SetTextOpt = 17,
    ServerRefresh = 18,
    SetPProfile = 19,
    UpdateStatus = 20,
    Cmesg = 33,
    JoinChan = 34,
    SessionState = 41,
    RoomHelper = 58,
    UsernameLookup = 59,
    Tags = 64,
    Bookmarks = 66,
    ExtData = 68,
    Metrics = 69,
    MyCamState = 71,
    MyWebcam = 72,
    TxProfile = 73,
    ManageList = 77,
}

impl MessageKind {
    /// Maps a wire value to a kind, falling back to [`MessageKind::Unknown`]
    /// for values missing from the constant table.
    pub fn from_i32(value: i32) -> Self {
        match value {
            -7 => Self::LoginComplete,
            -6 => Self::TagsLoaded,
            -5 => Self::Disconnected,
            -4 => Self::ModelsLoaded,
            -3 => Self::Connected,
            -2 => Self::Any,
            0 => Self::Null,
            1 => Self::Login,
            2 => Self::AddFriend,
            3 => Self::Pmesg,
            4 => Self::Status,
            5 => Self::Details,
            6 => Self::TokenInc,
            7 => Self::AddIgnore,
            8 => Self::Logout,
            9 => Self::DelFriend,
            10 => Self::DelIgnore,
            11 => Self::BanChan,
            12 => Self::ForceChat,
            13 => Self::GlobalMsg,
            14 => Self::EventMsg,
            15 => Self::StateDump,
            16 => Self::Tkx,
            17 => Self::SetTextOpt,
            18 => Self::ServerRefresh,
            19 => Self::SetPProfile,
            20 => Self::UpdateStatus,
            33 => Self::Cmesg,
            34 => Self::JoinChan,
            41 => Self::SessionState,
            58 => Self::RoomHelper,
            59 => Self::UsernameLookup,
            64 => Self::Tags,
            66 => Self::Bookmarks,
            68 => Self::ExtData,
            69 => Self::Metrics,
            71 => Self::MyCamState,
            72 => Self::MyWebcam,
            73 => Self::TxProfile,
            77 => Self::ManageList,
            _ => Self::Unknown,
        }
    }

    /// Returns the wire value of this kind.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns true for locally-generated lifecycle kinds that never appear
    /// on the wire.
    pub fn is_synthetic(self) -> bool {
        self.as_i32() < 0
    }
}

/// A message payload.
///
/// Payload bytes are UTF-8 text that the codec tries to parse as JSON,
/// keeping the raw text verbatim when parsing fails.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// Structured payload (valid JSON).
    Json(Value),
    /// Raw text payload (absent or invalid JSON).
    Text(String),
    /// No payload bytes.
    #[default]
    None,
}

impl Payload {
    /// Decodes payload text: JSON when syntactically valid, verbatim text
    /// otherwise. Empty input decodes to [`Payload::None`].
    pub fn decode(text: &str) -> Self {
        if text.is_empty() {
            return Self::None;
        }
        match serde_json::from_str(text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(text.to_string()),
        }
    }

    /// Encodes the payload back to its wire text.
    pub fn encode(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
            Self::None => String::new(),
        }
    }

    /// Returns the structured payload as a JSON object, if it is one.
    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        match self {
            Self::Json(value) => value.as_object(),
            _ => None,
        }
    }

    /// Returns the payload as text: raw text, or a JSON string value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(value) => value.as_str(),
            Self::None => None,
        }
    }

    /// Returns the structured payload value, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns true when there is no payload.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// One decoded wire frame (or a synthetic lifecycle event).
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub from: i32,
    pub to: i32,
    pub arg1: i32,
    pub arg2: i32,
    pub payload: Payload,
}

impl Message {
    /// Creates a synthetic lifecycle message with empty routing fields.
    pub fn synthetic(kind: MessageKind) -> Self {
        Self {
            kind,
            from: 0,
            to: 0,
            arg1: 0,
            arg2: 0,
            payload: Payload::None,
        }
    }
}
