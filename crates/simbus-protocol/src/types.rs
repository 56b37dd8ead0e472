//! Core protocol types: route identifiers, action tags, and the
//! [`ActionMessage`] that travels between cores and brokers.
//!
//! The comms layer treats a message as an opaque routable unit. Only the
//! `Protocol` action is interpreted below the owning core/broker, and only
//! through its [`ProtocolCommand`] sub-command.

use std::fmt;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// RouteId
// ---------------------------------------------------------------------------

/// Logical destination identifier within one comms instance.
///
/// Two values are reserved:
/// - [`RouteId::PARENT`] (0) always targets the broker connection.
/// - [`RouteId::CONTROL`] (-1) carries instructions for the comms loops
///   themselves and never leaves the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub i32);

impl RouteId {
    /// The route to this instance's upstream broker.
    pub const PARENT: RouteId = RouteId(0);

    /// The comms-internal control route.
    pub const CONTROL: RouteId = RouteId(-1);

    /// Returns `true` for the broker route.
    pub fn is_parent(self) -> bool {
        self == Self::PARENT
    }

    /// Returns `true` for the control route.
    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }

    /// Returns `true` if the id is reserved and cannot be assigned with
    /// `add_route`.
    pub fn is_reserved(self) -> bool {
        self.is_parent() || self.is_control()
    }
}

impl From<i32> for RouteId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PARENT => write!(f, "parent"),
            Self::CONTROL => write!(f, "control"),
            RouteId(id) => write!(f, "route-{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The action tag of a message. Encoded on the wire as a big-endian `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum Action {
    /// A message the receiver is expected to discard.
    #[default]
    Ignore = 0,
    /// Generic acknowledgement.
    Ack = 1,
    /// Application data.
    Data = 2,
    /// The sender is leaving the federation.
    Disconnect = 3,
    /// An error report.
    Error = 4,
    /// A subordinate broker asks to be registered with its parent.
    RegisterBroker = 10,
    /// The parent acknowledges a broker registration.
    BrokerAck = 11,
    /// Comms-level control; see [`ProtocolCommand`].
    Protocol = 60000,
}

impl Action {
    /// Every known action, in code order.
    pub const ALL: [Action; 8] = [
        Action::Ignore,
        Action::Ack,
        Action::Data,
        Action::Disconnect,
        Action::Error,
        Action::RegisterBroker,
        Action::BrokerAck,
        Action::Protocol,
    ];

    /// The wire code of this action.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Action {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|action| action.code() == code)
            .ok_or(ProtocolError::UnknownAction(code))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ignore => "ignore",
            Self::Ack => "ack",
            Self::Data => "data",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::RegisterBroker => "register_broker",
            Self::BrokerAck => "broker_ack",
            Self::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ProtocolCommand
// ---------------------------------------------------------------------------

/// Sub-commands of [`Action::Protocol`], carried in `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProtocolCommand {
    /// Registration: the connecting peer announces its name.
    ConnectionInfo = 10,
    /// The accepting peer's reply to a registration, carrying its name.
    ConnectionAck = 11,
    /// Close instruction on the control route, or a goodbye on the wire.
    Disconnect = 12,
    /// Bookkeeping marker for a route added while live.
    NewRoute = 13,
}

impl ProtocolCommand {
    /// Looks up a sub-command by its `message_id` value.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            10 => Some(Self::ConnectionInfo),
            11 => Some(Self::ConnectionAck),
            12 => Some(Self::Disconnect),
            13 => Some(Self::NewRoute),
            _ => None,
        }
    }

    /// The `message_id` value of this sub-command.
    pub fn id(self) -> i32 {
        self as i32
    }
}

// ---------------------------------------------------------------------------
// ActionMessage
// ---------------------------------------------------------------------------

/// The unit of communication between cores and brokers.
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │ action: Data          message_id: 0      │  ← what it is
/// │ source_id/handle      dest_id/handle     │  ← routing hints
/// │ flags                                    │
/// │ name: "fed1"                             │  ← identifier string
/// │ payload: [...opaque bytes...]            │
/// └──────────────────────────────────────────┘
/// ```
///
/// A message is built by a producer, handed to `transmit`, and owned by
/// the comms layer from then on. The receiver rebuilds it from bytes and
/// passes it by value to the registered callback.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionMessage {
    pub action: Action,
    /// Sub-command for `Protocol` messages, free for other actions.
    pub message_id: i32,
    pub source_id: i32,
    pub source_handle: i32,
    pub dest_id: i32,
    pub dest_handle: i32,
    pub flags: u16,
    pub name: String,
    pub payload: Vec<u8>,
}

impl ActionMessage {
    /// Creates an empty message with the given action.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    /// Creates a `Protocol` message carrying the given sub-command.
    pub fn protocol(command: ProtocolCommand) -> Self {
        Self {
            action: Action::Protocol,
            message_id: command.id(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_source(mut self, id: i32, handle: i32) -> Self {
        self.source_id = id;
        self.source_handle = handle;
        self
    }

    pub fn with_dest(mut self, id: i32, handle: i32) -> Self {
        self.dest_id = id;
        self.dest_handle = handle;
        self
    }

    /// Returns the sub-command if this is a `Protocol` message with a
    /// recognised `message_id`.
    pub fn protocol_command(&self) -> Option<ProtocolCommand> {
        if self.action == Action::Protocol {
            ProtocolCommand::from_id(self.message_id)
        } else {
            None
        }
    }

    /// Returns `true` if this is a `Protocol` message with the given
    /// sub-command.
    pub fn is_protocol(&self, command: ProtocolCommand) -> bool {
        self.protocol_command() == Some(command)
    }
}

impl From<Action> for ActionMessage {
    fn from(action: Action) -> Self {
        Self::new(action)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_id_reserved_values() {
        assert!(RouteId::PARENT.is_parent());
        assert!(RouteId::CONTROL.is_control());
        assert!(RouteId(0).is_reserved());
        assert!(RouteId(-1).is_reserved());
        assert!(!RouteId(3).is_reserved());
    }

    #[test]
    fn test_route_id_display() {
        assert_eq!(RouteId::PARENT.to_string(), "parent");
        assert_eq!(RouteId::CONTROL.to_string(), "control");
        assert_eq!(RouteId(7).to_string(), "route-7");
    }

    #[test]
    fn test_action_code_round_trip_for_all_tags() {
        for action in Action::ALL {
            assert_eq!(Action::try_from(action.code()), Ok(action));
        }
    }

    #[test]
    fn test_unknown_action_code() {
        assert_eq!(
            Action::try_from(12345),
            Err(ProtocolError::UnknownAction(12345))
        );
    }

    #[test]
    fn test_protocol_command_lookup() {
        let msg = ActionMessage::protocol(ProtocolCommand::ConnectionInfo)
            .with_name("core1");
        assert_eq!(
            msg.protocol_command(),
            Some(ProtocolCommand::ConnectionInfo)
        );
        assert!(msg.is_protocol(ProtocolCommand::ConnectionInfo));
        assert!(!msg.is_protocol(ProtocolCommand::Disconnect));
    }

    #[test]
    fn test_protocol_command_ignored_for_other_actions() {
        let mut msg = ActionMessage::new(Action::Data);
        msg.message_id = ProtocolCommand::Disconnect.id();
        assert_eq!(msg.protocol_command(), None);
    }

    #[test]
    fn test_message_from_action() {
        let msg: ActionMessage = Action::Ack.into();
        assert_eq!(msg.action, Action::Ack);
        assert!(msg.name.is_empty());
        assert!(msg.payload.is_empty());
    }
}
