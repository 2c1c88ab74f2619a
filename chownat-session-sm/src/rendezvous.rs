//! Format of the rendezvous UDP datagrams:
//! +-----------+----------------+
//! | DIRECTION |    PAYLOAD     |
//! +-----------+----------------+
//! | request   | "01\n" (3 B)   |
//! | reply     | "03\n" (3 B)   |
//! +-----------+----------------+
//!
//! The initiator sends a [`REQUEST`] to the responder's control port, and the responder answers
//! with an [`ACKNOWLEDGMENT`] sent back to whichever address the request came from. Neither
//! message carries any other data, and nothing is authenticated: the exchange only exists to
//! create outbound UDP state on any NAT or firewall in between and to confirm both peers are up.

/// The datagram an initiator sends to ask for a rendezvous.
pub const REQUEST: [u8; 3] = *b"01\n";

/// The datagram a responder answers a [`REQUEST`] with.
pub const ACKNOWLEDGMENT: [u8; 3] = *b"03\n";

/// The size of the buffer used to receive rendezvous datagrams. Anything longer than this is
/// truncated, which is fine since it wouldn't be a valid message anyway.
pub const MAX_DATAGRAM_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The reply was empty.
    Empty,

    /// The reply had content, but it wasn't an [`ACKNOWLEDGMENT`].
    Unexpected,
}

/// Returns whether a datagram received by the responder is a rendezvous request.
pub fn is_request(datagram: &[u8]) -> bool {
    datagram == REQUEST
}

/// Checks a datagram received by the initiator. Only an exact [`ACKNOWLEDGMENT`] is accepted.
pub fn check_reply(datagram: &[u8]) -> Result<(), ReplyError> {
    if datagram.is_empty() {
        Err(ReplyError::Empty)
    } else if datagram != ACKNOWLEDGMENT {
        Err(ReplyError::Unexpected)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_must_match_exactly() {
        assert!(is_request(b"01\n"));
        assert!(!is_request(b"01"));
        assert!(!is_request(b"01\n\n"));
        assert!(!is_request(b"03\n"));
        assert!(!is_request(b""));
    }

    #[test]
    fn test_check_reply() {
        assert_eq!(check_reply(b"03\n"), Ok(()));
        assert_eq!(check_reply(b""), Err(ReplyError::Empty));
        assert_eq!(check_reply(b"02\n"), Err(ReplyError::Unexpected));
        assert_eq!(check_reply(b"03\nextra"), Err(ReplyError::Unexpected));
        assert_eq!(check_reply(b"01\n"), Err(ReplyError::Unexpected));
    }
}
