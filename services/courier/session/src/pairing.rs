//! Pairing helpers: identity normalization, code formatting and the
//! take-once notifier that reports the pairing outcome to the caller.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Outcome of a pairing flow as seen by the requesting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingReply {
    /// A pairing code was issued, formatted for display
    Code(String),
    /// The transport opened without needing a code
    Connected,
    /// The pairing code could not be obtained
    Failed(String),
}

/// Delivers at most one [`PairingReply`] to whoever started the session.
///
/// Clones share the same slot, so the reply is delivered exactly once no
/// matter how many connection attempts observe the pairing flow.
#[derive(Debug, Clone)]
pub struct PairingNotifier {
    slot: Arc<Mutex<Option<oneshot::Sender<PairingReply>>>>,
}

impl PairingNotifier {
    /// Create a notifier and the receiver its reply lands in
    pub fn channel() -> (Self, oneshot::Receiver<PairingReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver `reply` if nothing was delivered yet. Returns whether the
    /// receiver got it.
    pub fn notify(&self, reply: PairingReply) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Whether a reply was already delivered
    pub fn is_spent(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Strip everything but ASCII digits
pub fn normalize_phone_number(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Group a raw pairing code into dash-separated blocks of four
pub fn format_pairing_code(code: &str) -> String {
    let chars: Vec<char> = code.trim().chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_number() {
        assert_eq!(normalize_phone_number("+49 (151) 123-4567"), "491511234567");
        assert_eq!(normalize_phone_number("abc"), "");
    }

    #[test]
    fn test_format_pairing_code() {
        assert_eq!(format_pairing_code("ABCDEFGH"), "ABCD-EFGH");
        assert_eq!(format_pairing_code("ABCDEF"), "ABCD-EF");
        assert_eq!(format_pairing_code(""), "");
    }

    #[tokio::test]
    async fn test_notifier_delivers_once() {
        let (notifier, rx) = PairingNotifier::channel();
        let clone = notifier.clone();
        assert!(!notifier.is_spent());

        assert!(clone.notify(PairingReply::Code("ABCD-EFGH".to_string())));
        assert!(notifier.is_spent());
        assert!(!notifier.notify(PairingReply::Connected));

        assert_eq!(rx.await.unwrap(), PairingReply::Code("ABCD-EFGH".to_string()));
    }

    #[test]
    fn test_notifier_with_dropped_receiver() {
        let (notifier, rx) = PairingNotifier::channel();
        drop(rx);
        assert!(!notifier.notify(PairingReply::Connected));
        assert!(notifier.is_spent());
    }
}
