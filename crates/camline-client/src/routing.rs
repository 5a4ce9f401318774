//! Data-driven routing from message kind to state-merge behavior.
//!
//! One inspectable table instead of a conditional cascade: every kind maps
//! to a [`MergeStrategy`], and the kinds excluded because they carry
//! transient/control signals rather than authoritative entity state are
//! part of the same table via [`is_transient`].

use camline_protocol::{ChannelOption, Message, MessageKind};

/// How a message's payload is folded into client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Login handshake response: drives the session state machine.
    Login,
    /// Detail-style payload merged into one entity's fields.
    EntityUpdate,
    /// Per-entity tag deltas merged into tag sets.
    TagUpdate,
    /// Bookmark list: each bookmarked entity merged individually.
    Bookmarks,
    /// Compact tabular bulk list: rows expanded and merged per entity.
    BulkList,
    /// Out-of-band payload reference to resolve and re-inject.
    ExtData,
    /// Stream-token payload captured into the session's stream context.
    StreamContext,
    /// No state change.
    None,
}

/// The kind-to-strategy table.
pub fn strategy_for(kind: MessageKind) -> MergeStrategy {
    use MessageKind::*;
    match kind {
        Login => MergeStrategy::Login,
        Details | RoomHelper | SessionState | AddFriend | AddIgnore | Cmesg | Pmesg
        | TxProfile | UsernameLookup | MyCamState | MyWebcam | JoinChan => {
            MergeStrategy::EntityUpdate
        }
        Tags => MergeStrategy::TagUpdate,
        Bookmarks => MergeStrategy::Bookmarks,
        ManageList => MergeStrategy::BulkList,
        ExtData => MergeStrategy::ExtData,
        Tkx => MergeStrategy::StreamContext,
        // High-volume counter updates; not authoritative entity state.
        Metrics => MergeStrategy::None,
        _ => MergeStrategy::None,
    }
}

/// Entity-update messages excluded from merging because they are transient
/// control signals: token-increment details, low-argument room-helper
/// traffic, and room-leave notifications.
pub fn is_transient(message: &Message) -> bool {
    match message.kind {
        MessageKind::Details => message.from == MessageKind::TokenInc.as_i32(),
        MessageKind::RoomHelper => message.arg2 < 100,
        MessageKind::JoinChan => message.arg2 == ChannelOption::Part as i32,
        _ => false,
    }
}
