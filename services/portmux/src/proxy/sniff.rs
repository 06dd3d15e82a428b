//! Protocol detection from the first bytes of a connection.
//!
//! Detection is shallow: only a handful of leading bytes are compared against
//! well-known prefixes. The connection is peeked, never read, so the relay
//! later forwards the exact bytes the client sent.

use std::fmt;
use std::io;

use super::net::Stream;

/// Maximum number of bytes peeked when classifying.
pub const PEEK_LIMIT: usize = 1023;

/// Bytes needed before a disguised connection can be classified.
pub const DISGUISE_PREFIX_LEN: usize = 3;

/// Request-line prefixes of the HTTP methods recognized.
const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST", b"HEAD", b"PUT ", b"DELE", b"OPTI", b"PATC", b"CONN", b"TRAC",
];

/// Content type and major version of a TLS handshake record.
const TLS_RECORD_PREFIX: &[u8] = &[0x16, 0x03];

/// Protocols the sniffer tells apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Http,
    Tls,
    Smtp,
    Unknown,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Ssh => "ssh",
            Protocol::Http => "http",
            Protocol::Tls => "tls",
            Protocol::Smtp => "smtp",
            Protocol::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of sniffing a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Bytes were available and matched (or failed to match) a prefix.
    Detected(Protocol),
    /// The client has not sent anything yet.
    NoData,
    /// The client closed before sending anything.
    Closed,
    /// I/O error during peek.
    IoError(String),
}

/// Peek at a stream and classify it.
pub fn sniff<S: Stream + ?Sized>(stream: &S) -> SniffResult {
    let mut buf = [0u8; PEEK_LIMIT];
    loop {
        return match stream.peek_into(&mut buf) {
            Ok(0) => SniffResult::Closed,
            Ok(n) => SniffResult::Detected(detect(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SniffResult::NoData,
            Err(e) => SniffResult::IoError(e.to_string()),
        };
    }
}

/// Classify the leading bytes of a plain (non-disguised) connection.
pub fn detect(data: &[u8]) -> Protocol {
    if data.starts_with(b"SSH-") {
        Protocol::Ssh
    } else if HTTP_METHODS.iter().any(|method| data.starts_with(method)) {
        Protocol::Http
    } else if data.starts_with(TLS_RECORD_PREFIX) {
        Protocol::Tls
    } else {
        Protocol::Unknown
    }
}

/// Classify the bytes a client sent after receiving the decoy banner.
///
/// Returns `None` until [`DISGUISE_PREFIX_LEN`] bytes are available. Anything
/// that does not open with `SSH` is taken to be an SMTP client.
pub fn detect_disguised(data: &[u8]) -> Option<Protocol> {
    if data.len() < DISGUISE_PREFIX_LEN {
        return None;
    }
    if data.starts_with(b"SSH") {
        Some(Protocol::Ssh)
    } else {
        Some(Protocol::Smtp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::net::Source;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::os::fd::RawFd;

    /// Stream whose peek returns a scripted outcome.
    struct Scripted(io::Result<Vec<u8>>);

    impl Read for Scripted {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            unreachable!("sniffing must not consume")
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Source for Scripted {
        fn handle(&self) -> RawFd {
            -1
        }
    }

    impl Stream for Scripted {
        fn peek_into(&self, buf: &mut [u8]) -> io::Result<usize> {
            match &self.0 {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
        fn half_close(&self) -> io::Result<()> {
            Ok(())
        }
        fn finish_connect(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[rstest]
    #[case::ssh(b"SSH-2.0-OpenSSH_9.6\r\n", Protocol::Ssh)]
    #[case::get(b"GET / HTTP/1.1\r\n", Protocol::Http)]
    #[case::post(b"POST /login HTTP/1.1\r\n", Protocol::Http)]
    #[case::head(b"HEAD / HTTP/1.0\r\n", Protocol::Http)]
    #[case::put(b"PUT /x HTTP/1.1\r\n", Protocol::Http)]
    #[case::delete(b"DELETE /x HTTP/1.1\r\n", Protocol::Http)]
    #[case::options(b"OPTIONS * HTTP/1.1\r\n", Protocol::Http)]
    #[case::patch(b"PATCH /x HTTP/1.1\r\n", Protocol::Http)]
    #[case::connect(b"CONNECT host:443 HTTP/1.1\r\n", Protocol::Http)]
    #[case::trace(b"TRACE / HTTP/1.1\r\n", Protocol::Http)]
    #[case::tls(&[0x16, 0x03, 0x01, 0x02, 0x00], Protocol::Tls)]
    #[case::opaque(b"\x00\x01binary", Protocol::Unknown)]
    #[case::short_ssh(b"SSH", Protocol::Unknown)]
    #[case::lowercase(b"get / HTTP/1.1\r\n", Protocol::Unknown)]
    fn test_detect(#[case] data: &[u8], #[case] expected: Protocol) {
        assert_eq!(detect(data), expected);
    }

    #[rstest]
    #[case::too_short(b"SS", None)]
    #[case::ssh(b"SSH-2.0-client", Some(Protocol::Ssh))]
    #[case::exact(b"SSH", Some(Protocol::Ssh))]
    #[case::ehlo(b"EHLO relay.example.org\r\n", Some(Protocol::Smtp))]
    #[case::helo(b"HEL", Some(Protocol::Smtp))]
    fn test_detect_disguised(#[case] data: &[u8], #[case] expected: Option<Protocol>) {
        assert_eq!(detect_disguised(data), expected);
    }

    #[test]
    fn test_sniff_detects_from_peek() {
        let stream = Scripted(Ok(b"SSH-2.0-x\r\n".to_vec()));
        assert_eq!(sniff(&stream), SniffResult::Detected(Protocol::Ssh));
    }

    #[test]
    fn test_sniff_no_data() {
        let stream = Scripted(Err(io::ErrorKind::WouldBlock.into()));
        assert_eq!(sniff(&stream), SniffResult::NoData);
    }

    #[test]
    fn test_sniff_closed() {
        let stream = Scripted(Ok(Vec::new()));
        assert_eq!(sniff(&stream), SniffResult::Closed);
    }

    #[test]
    fn test_sniff_error() {
        let stream = Scripted(Err(io::ErrorKind::ConnectionReset.into()));
        assert!(matches!(sniff(&stream), SniffResult::IoError(_)));
    }
}
