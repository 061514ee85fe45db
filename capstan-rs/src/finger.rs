//! The finger wire protocol shared by the per-executor log streamer and
//! the gateway: one ASCII hex build id terminated by `\n` or `\r\n`,
//! answered with raw log bytes until EOF, or a single error line.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum request bytes before the delimiter.
pub const MAX_REQUEST_LEN: usize = 1024;

pub fn invalid_build_id_msg(id: &str) -> String {
    format!("Build ID {id} is not valid")
}

pub fn not_found_msg(id: &str) -> String {
    format!("Build ID {id} not found")
}

pub const INTERNAL_ERROR_MSG: &str = "Internal streaming error";

/// Read the request line. Bytes are consumed one at a time so nothing past
/// the delimiter is ever taken from the socket; the server never reads the
/// client again after this returns.
pub async fn read_request_line<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<String> {
    let mut line: Vec<u8> = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request line",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_REQUEST_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request line too long",
            ));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "request line is not ASCII")
    })
}

/// Build ids are ASCII hex, upper or lower case.
pub fn is_valid_build_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_lf_terminated_line() {
        let mut input: &[u8] = b"abcdef012345\n";
        assert_eq!(read_request_line(&mut input).await.unwrap(), "abcdef012345");
    }

    #[tokio::test]
    async fn test_reads_crlf_terminated_line() {
        let mut input: &[u8] = b"ABCDEF\r\n";
        assert_eq!(read_request_line(&mut input).await.unwrap(), "ABCDEF");
    }

    #[tokio::test]
    async fn test_rejects_overlong_request() {
        let long = vec![b'a'; MAX_REQUEST_LEN + 1];
        let mut input: &[u8] = &long;
        let err = read_request_line(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_before_delimiter() {
        let mut input: &[u8] = b"abc";
        let err = read_request_line(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_build_id_validation() {
        assert!(is_valid_build_id("abcdef012345"));
        assert!(is_valid_build_id("ABCDEF012345"));
        assert!(!is_valid_build_id(""));
        assert!(!is_valid_build_id("not-hex"));
        assert!(!is_valid_build_id("abc/..{}"));
    }
}
