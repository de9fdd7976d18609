use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;

/// Network connection state of a channel, as reported by the adapter.
///
/// The numeric values are the ones used by networked adapter firmware; a
/// direct adapter only ever reports `Disconnected` or `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ConnectState {
    Disconnected = 1,
    Connecting = 2,
    Connected = 3,
    Disconnecting = 4,
    Uninitialized = 5,
}

impl From<u8> for ConnectState {
    fn from(raw: u8) -> Self {
        ConnectState::from_u8(raw).unwrap_or(ConnectState::Uninitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_adapter_codes() {
        assert_eq!(ConnectState::from(1), ConnectState::Disconnected);
        assert_eq!(ConnectState::from(3), ConnectState::Connected);
        assert_eq!(ConnectState::from(0), ConnectState::Uninitialized);
        assert_eq!(ConnectState::from(99), ConnectState::Uninitialized);
    }
}
