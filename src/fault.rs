//! # Transport Fault Classification
//!
//! The device library reports failures as plain strings, so recovery
//! decisions are made by matching known substrings. All signatures live in
//! [`SIGNATURES`]; nothing else in the crate inspects error text.
//!
//! | Kind | Meaning | Recovery |
//! |------|---------|----------|
//! | [`FaultKind::AlreadyConnected`] | session is already up | treat as success |
//! | [`FaultKind::HandleFatal`] | client handle is unusable | release, allocate, retry once |
//! | [`FaultKind::TransportStack`] | BLE stack fault | keep-alive releases and reallocates |
//! | [`FaultKind::Unclassified`] | anything else | reset status only |

use crate::transport::TransportError;

/// Class of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Idempotent success ("already connected")
    AlreadyConnected,
    /// Duplicate registration, canceled connection, dial failure
    HandleFatal,
    /// Socket, I/O, timeout and device-not-found faults
    TransportStack,
    /// No known signature
    Unclassified,
}

/// Ordered signature table. First match wins, matching is case-insensitive.
pub const SIGNATURES: &[(&str, FaultKind)] = &[
    ("already connected", FaultKind::AlreadyConnected),
    ("already exists", FaultKind::HandleFatal),
    ("duplicate", FaultKind::HandleFatal),
    ("connection canceled", FaultKind::HandleFatal),
    ("connection cancelled", FaultKind::HandleFatal),
    ("dial", FaultKind::HandleFatal),
    ("socket", FaultKind::TransportStack),
    ("broken pipe", FaultKind::TransportStack),
    ("connection reset", FaultKind::TransportStack),
    ("device not found", FaultKind::TransportStack),
    ("not found", FaultKind::TransportStack),
    ("timeout", FaultKind::TransportStack),
    ("timed out", FaultKind::TransportStack),
    ("i/o error", FaultKind::TransportStack),
    ("input/output error", FaultKind::TransportStack),
];

impl FaultKind {
    /// Classify a raw transport message.
    pub fn of(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        SIGNATURES
            .iter()
            .find(|(signature, _)| message.contains(signature))
            .map(|&(_, kind)| kind)
            .unwrap_or(FaultKind::Unclassified)
    }

    /// `connect` swaps the handle for a fresh one and retries once.
    pub fn recreates_handle_on_connect(self) -> bool {
        self == FaultKind::HandleFatal
    }

    /// A keep-alive cycle escalates to a full release and reallocation.
    pub fn escalates_in_maintenance(self) -> bool {
        matches!(self, FaultKind::HandleFatal | FaultKind::TransportStack)
    }
}

/// Classify a transport error.
pub fn classify(err: &TransportError) -> FaultKind {
    FaultKind::of(err.message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_connected_is_success() {
        assert_eq!(
            FaultKind::of("Device already connected"),
            FaultKind::AlreadyConnected
        );
    }

    #[test]
    fn test_handle_fatal_signatures() {
        for msg in [
            "already exists",
            "org.bluez.Error.AlreadyExists: Already Exists",
            "connection canceled",
            "le-connection cancelled by host",
            "failed to dial device",
        ] {
            assert_eq!(FaultKind::of(msg), FaultKind::HandleFatal, "{}", msg);
        }
    }

    #[test]
    fn test_transport_stack_signatures() {
        for msg in [
            "write: broken pipe",
            "read: connection reset by peer",
            "socket closed",
            "device not found",
            "scan timeout",
            "operation timed out",
            "I/O error",
            "Input/output error",
        ] {
            assert_eq!(FaultKind::of(msg), FaultKind::TransportStack, "{}", msg);
        }
    }

    #[test]
    fn test_unclassified() {
        assert_eq!(FaultKind::of("invalid address"), FaultKind::Unclassified);
        assert_eq!(FaultKind::of(""), FaultKind::Unclassified);
    }

    #[test]
    fn test_recovery_policy() {
        assert!(FaultKind::HandleFatal.recreates_handle_on_connect());
        assert!(!FaultKind::TransportStack.recreates_handle_on_connect());
        assert!(FaultKind::HandleFatal.escalates_in_maintenance());
        assert!(FaultKind::TransportStack.escalates_in_maintenance());
        assert!(!FaultKind::Unclassified.escalates_in_maintenance());
        assert!(!FaultKind::AlreadyConnected.escalates_in_maintenance());
    }

    #[test]
    fn test_classify_transport_error() {
        let err = TransportError::new("broken pipe");
        assert_eq!(classify(&err), FaultKind::TransportStack);
    }
}
