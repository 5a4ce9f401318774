//! Numeric constant tables published by the platform.
//!
//! The platform exposes these values in its client-side script; a build-time
//! generator keeps them current. Only the subsets the session engine actually
//! routes on are carried here.

/// Default chat-server TCP port.
pub const CHAT_PORT: u16 = 8100;

/// Protocol version constant sent as `arg1` of the login command.
pub const LOGIN_VERSION: i32 = 20071025;

/// Ext-data option flag: the referenced payload is a Redis-held JSON
/// document the client must fetch out-of-band.
pub const WOPT_REDIS_JSON: i32 = 256;

/// Video/session state of a broadcaster. Friendlier names than the raw
/// transmit-state constants for log messages and readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VideoState {
    FreeChat = 0,
    Away = 2,
    Private = 12,
    GroupShow = 13,
    ClubShow = 14,
    Online = 90,
    ViewingPrivate = 91,
    Offline = 127,
}

impl VideoState {
    /// Maps a wire value to a state, if it is one we know.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::FreeChat),
            2 => Some(Self::Away),
            12 => Some(Self::Private),
            13 => Some(Self::GroupShow),
            14 => Some(Self::ClubShow),
            90 => Some(Self::Online),
            91 => Some(Self::ViewingPrivate),
            127 => Some(Self::Offline),
            _ => None,
        }
    }
}

/// User privilege level, carried as `lv` in entity payloads. Broadcasters
/// are level [`UserLevel::Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum UserLevel {
    Guest = 0,
    Basic = 1,
    Premium = 2,
    Model = 4,
    Admin = 5,
}

impl UserLevel {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Guest),
            1 => Some(Self::Basic),
            2 => Some(Self::Premium),
            4 => Some(Self::Model),
            5 => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Channel operation selector for room join/leave commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChannelOption {
    None = 0,
    Join = 2,
    Part = 4,
}

/// Bulk-list type carried as `arg2` of a manage-list message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ListType {
    Roommates = 1,
    Cams = 2,
    Friends = 4,
    Ignores = 8,
    Tags = 64,
}

impl ListType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Roommates),
            2 => Some(Self::Cams),
            4 => Some(Self::Friends),
            8 => Some(Self::Ignores),
            64 => Some(Self::Tags),
            _ => None,
        }
    }
}
