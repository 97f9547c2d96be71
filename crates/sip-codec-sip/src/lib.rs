//! External SIP parser collaborator (spec §1, §4.2, §6).
//!
//! This is deliberately the thin end of the stack: implementing SIP message
//! *semantics* (methods, header field grammar, URI parsing) is out of
//! scope. What transport framing actually needs is message *boundaries* —
//! where does this message end and the next one begin in the byte stream —
//! and that is a much smaller problem: scan for the header/body separator,
//! read `Content-Length` out of the header block, and the message ends
//! `Content-Length` bytes after that. A bare double-CRLF with no preceding
//! header block is treated as a keep-alive ping (RFC 5626 §4.4.1) rather
//! than a message.
//!
//! Real deployments plug in a full parser here; this crate exists so the
//! transport crates have a real, runnable collaborator to build and test
//! against without depending on one.

use sip_core::{FrameOutcome, MessageFramer};

const CRLFCRLF: &[u8] = b"\r\n\r\n";
const LFLF: &[u8] = b"\n\n";

/// Framer over the Content-Length convention SIP mandates for stream
/// transports (RFC 3261 §18.3): find the blank line ending the header
/// block, read `Content-Length` out of it, and the message is the header
/// block plus exactly that many body bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SipStreamFramer;

impl SipStreamFramer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageFramer for SipStreamFramer {
    fn parse(&self, window: &[u8]) -> FrameOutcome {
        // A message that starts with the header terminator and nothing
        // else buffered in front of it is a double-CRLF keep-alive ping,
        // not a message; skip it and let the caller advance past it.
        if window.starts_with(CRLFCRLF) {
            return FrameOutcome::Complete { message: Vec::new(), consumed: CRLFCRLF.len() };
        }
        if window.starts_with(LFLF) {
            return FrameOutcome::Complete { message: Vec::new(), consumed: LFLF.len() };
        }

        let header_end = match find_header_terminator(window) {
            Some(end) => end,
            None => return FrameOutcome::Incomplete,
        };

        let headers = &window[..header_end];
        let content_length = match find_content_length(headers) {
            Some(Ok(len)) => len,
            Some(Err(())) => return FrameOutcome::Invalid,
            // RFC 3261 allows omitting Content-Length when the transport
            // itself delimits the message (e.g. UDP); on a stream transport
            // there is no such delimiter, so a missing header means this
            // message has no body rather than an unknown length.
            None => 0,
        };

        let total_len = header_end + content_length;
        if window.len() < total_len {
            return FrameOutcome::Incomplete;
        }

        FrameOutcome::Complete {
            message: window[..total_len].to_vec(),
            consumed: total_len,
        }
    }
}

/// Finds the end of the header block: the index just past the first blank
/// line (`\r\n\r\n` or a bare `\n\n`, tolerating interop with implementations
/// that drop the `\r`).
fn find_header_terminator(window: &[u8]) -> Option<usize> {
    let crlf = window
        .windows(CRLFCRLF.len())
        .position(|w| w == CRLFCRLF)
        .map(|idx| idx + CRLFCRLF.len());
    let lf = window
        .windows(LFLF.len())
        .position(|w| w == LFLF)
        .map(|idx| idx + LFLF.len());
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Scans the header block for `Content-Length` (or its compact form `l`,
/// RFC 3261 §7.3.3), case-insensitively. Returns `Some(Err(()))` if the
/// header is present but its value isn't a plain decimal integer —
/// unrecoverable framing, per spec §4.2/§7.
fn find_content_length(headers: &[u8]) -> Option<Result<usize, ()>> {
    for line in split_lines(headers) {
        let mut parts = line.splitn(2, |&b| b == b':');
        let name = parts.next()?;
        let value = parts.next()?;
        let name = std::str::from_utf8(name).ok()?.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let value = std::str::from_utf8(value).ok()?.trim();
            return Some(value.parse::<usize>().map_err(|_| ()));
        }
    }
    None
}

fn split_lines(headers: &[u8]) -> impl Iterator<Item = &[u8]> {
    headers.split(|&b| b == b'\n').map(|line| {
        if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_until_header_terminator_seen() {
        let framer = SipStreamFramer::new();
        assert!(matches!(framer.parse(b"INVITE sip:bob@example.com SIP/2.0\r\n"), FrameOutcome::Incomplete));
    }

    #[test]
    fn incomplete_until_body_fully_buffered() {
        let framer = SipStreamFramer::new();
        let window = b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: 10\r\n\r\n12345";
        assert!(matches!(framer.parse(window), FrameOutcome::Incomplete));
    }

    #[test]
    fn complete_message_with_content_length_consumes_header_plus_body() {
        let framer = SipStreamFramer::new();
        let mut window = b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: 5\r\n\r\n".to_vec();
        window.extend_from_slice(b"abcde trailing garbage");
        match framer.parse(&window) {
            FrameOutcome::Complete { message, consumed } => {
                assert!(message.ends_with(b"abcde"));
                assert_eq!(consumed, window.len() - b" trailing garbage".len());
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn message_with_no_body_and_no_content_length_is_just_the_headers() {
        let framer = SipStreamFramer::new();
        let window = b"OPTIONS sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/TCP host\r\n\r\n";
        match framer.parse(window) {
            FrameOutcome::Complete { message, consumed } => {
                assert_eq!(consumed, window.len());
                assert_eq!(message, window);
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn compact_content_length_header_is_honoured() {
        let framer = SipStreamFramer::new();
        let mut window = b"INVITE sip:bob@example.com SIP/2.0\r\nl: 3\r\n\r\n".to_vec();
        window.extend_from_slice(b"xyz");
        match framer.parse(&window) {
            FrameOutcome::Complete { message, consumed } => {
                assert_eq!(consumed, window.len());
                assert!(message.ends_with(b"xyz"));
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn non_numeric_content_length_is_invalid_framing() {
        let framer = SipStreamFramer::new();
        let window = b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: not-a-number\r\n\r\n";
        assert!(matches!(framer.parse(window), FrameOutcome::Invalid));
    }

    #[test]
    fn bare_double_crlf_is_treated_as_a_keepalive_ping() {
        let framer = SipStreamFramer::new();
        match framer.parse(b"\r\n\r\nINVITE sip:bob@example.com SIP/2.0\r\n\r\n") {
            FrameOutcome::Complete { message, consumed } => {
                assert!(message.is_empty());
                assert_eq!(consumed, 4);
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn two_messages_back_to_back_extract_independently_via_stream_connection() {
        use sip_core::{ConnectionId, EndPoint, Protocol, StreamConnection, StreamDirection};
        let framer = SipStreamFramer::new();
        let remote = EndPoint::new(Protocol::Tcp, "127.0.0.1".parse().unwrap(), 5060);
        let mut conn = StreamConnection::new(ConnectionId::random(), StreamDirection::Accepted, remote);
        let mut first = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n".to_vec();
        let second = b"OPTIONS sip:c@d SIP/2.0\r\nContent-Length: 0\r\n\r\n".to_vec();
        first.extend_from_slice(&second);
        conn.append(&first);
        let messages = conn.extract_messages(&framer).unwrap();
        assert_eq!(messages.len(), 2);
    }
}
