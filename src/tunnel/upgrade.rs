//! Raw HTTP/1.1 plumbing for relaying protocol upgrades over a tunnel socket.
//!
//! Upgrades bypass the HTTP client entirely: the public request head is
//! re-serialized as literal text onto the borrowed socket, the backend's
//! response head is parsed with `httparse`, and on `101` the two sockets are
//! spliced byte-for-byte.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::UpgradeError;

const MAX_RESPONSE_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;

/// Serialize a request line and header pairs into a literal HTTP/1.x head.
///
/// Lines are CRLF-joined and the block ends with an empty line, so the output
/// can be written straight onto a socket the backend parses as a request.
///
/// Pairs are written in the order given. Callers passing a `HeaderMap` get
/// lowercase names with repeated names grouped together, not the requester's
/// original casing and interleaving; hyper does not keep the raw head.
pub fn format_request_head<'a, I>(method: &str, target: &str, version: Version, headers: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.push(b' ');
    head.extend_from_slice(version_str(version).as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// A parsed backend response head plus any bytes read past it.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes that arrived in the same reads as the head. They belong to the
    /// body or, after a `101`, to the upgraded protocol.
    pub leftover: Bytes,
}

impl ResponseHead {
    /// Declared `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(axum::http::header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }
}

/// Read and parse an HTTP/1.x response head, giving up after `max_bytes`.
pub async fn read_response_head<R>(io: &mut R, max_bytes: usize) -> Result<ResponseHead, UpgradeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        if io.read_buf(&mut buf).await? == 0 {
            return Err(UpgradeError::ClosedBeforeHead);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf)? {
            httparse::Status::Complete(head_len) => {
                let code = response.code.ok_or(UpgradeError::InvalidStatus)?;
                let status = StatusCode::from_u16(code).map_err(|_| UpgradeError::InvalidStatus)?;
                let mut map = HeaderMap::with_capacity(response.headers.len());
                for header in response.headers.iter() {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(header.name.as_bytes()),
                        HeaderValue::from_bytes(header.value),
                    ) {
                        map.append(name, value);
                    }
                }
                let leftover = buf.split_off(head_len).freeze();
                return Ok(ResponseHead {
                    status,
                    headers: map,
                    leftover,
                });
            }
            httparse::Status::Partial if buf.len() >= max_bytes => {
                return Err(UpgradeError::HeadTooLarge(max_bytes));
            }
            httparse::Status::Partial => {}
        }
    }
}

/// Splice two connections after an accepted upgrade.
///
/// `leftover` (bytes the backend sent right after its `101` head) is written to
/// the public side first. Returns when either side closes or fails; both
/// connections are dropped on return.
pub async fn splice<P, T>(mut public: P, mut tunnel: T, leftover: Bytes) -> std::io::Result<(u64, u64)>
where
    P: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        public.write_all(&leftover).await?;
    }
    tokio::io::copy_bidirectional(&mut public, &mut tunnel).await
}
