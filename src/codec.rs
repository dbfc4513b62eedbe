//! wire codec: request serialization and incremental response parsing.
//!
//! no chunked or streaming body support: requests carry a single pre-encoded body and responses
//! are only ever read by `Content-Length`.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};

use crate::error::Error;

/// one request header, kept in submission order with duplicates preserved -- the wire codec
/// never normalizes or dedupes these, matching the "ordered key/value pairs, duplicates allowed"
/// requirement in the data model.
#[derive(Debug, Clone)]
pub struct HeaderList(pub(crate) Vec<(String, Vec<u8>)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl Default for HeaderList {
    fn default() -> Self {
        Self::new()
    }
}

/// the wire-level parts of a request: everything the codec needs to serialize a byte stream.
/// request-level retry/callback/timeout configuration lives on [`crate::connection::RequestSpec`]
/// instead -- this type is intentionally the minimal "one step above raw sockets" record.
pub struct WireRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub version: Version,
    pub headers: &'a HeaderList,
    pub body: &'a [u8],
}

/// emit `METHOD SP path[?query] SP PROTOCOL CRLF`, each header verbatim, a blank line, then the
/// body, exactly as submitted -- no escaping, no reordering, no injected headers beyond `Host`
/// when missing.
pub fn encode_request(req: &WireRequest<'_>, host_header: Option<&str>, buf: &mut BytesMut) {
    buf.put_slice(req.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(req.path.as_bytes());
    if let Some(q) = req.query {
        buf.put_u8(b'?');
        buf.put_slice(q.as_bytes());
    }
    buf.put_u8(b' ');
    buf.put_slice(version_str(req.version).as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(host) = host_header {
        if !req.headers.contains("host") {
            buf.put_slice(b"Host: ");
            buf.put_slice(host.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    for (name, value) in req.headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(req.body);
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// parsed response head plus how many bytes of `buf` it consumed.
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    consumed: usize,
}

const MAX_HEADERS: usize = 96;

/// attempt to parse a response head out of `buf`. returns `Ok(None)` when the buffer does not
/// yet contain a full `CRLFCRLF`-terminated head (more bytes are needed), following
/// `httparse::Status`'s partial/complete split.
pub fn try_decode_head(buf: &[u8]) -> Result<Option<ResponseHead>, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);

    match parsed.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(consumed) => {
            let version = match parsed.version {
                Some(1) => Version::HTTP_11,
                _ => Version::HTTP_10,
            };
            let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                .map_err(|_| Error::UnsupportedResponse("malformed status code"))?;

            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for h in parsed.headers.iter() {
                let name = http::HeaderName::from_bytes(h.name.as_bytes())?;
                let value = http::HeaderValue::from_bytes(h.value)?;
                headers.append(name, value);
            }

            Ok(Some(ResponseHead {
                version,
                status,
                headers,
                consumed,
            }))
        }
    }
}

/// the declared `Content-Length` of a response, or a terminal error if absent -- chunked and
/// identity-to-EOF bodies are not supported (explicit non-goals).
pub fn content_length(headers: &HeaderMap) -> Result<usize, Error> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .ok_or(Error::UnsupportedResponse("missing Content-Length header"))
        .and_then(|v| v.to_str().map_err(|_| Error::UnsupportedResponse("non-ascii Content-Length")))
        .and_then(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| Error::UnsupportedResponse("non-numeric Content-Length"))
        })
}

/// whether the response indicates the connection should stay open for reuse: HTTP/1.1 without an
/// explicit `Connection: close`. HTTP/1.0 is conservatively never cached, even with an explicit
/// `Connection: keep-alive`.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if version != Version::HTTP_11 {
        return false;
    }
    !headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// discard the head bytes from `buf` once [`try_decode_head`] has located `CRLFCRLF`, returning
/// whatever body bytes arrived alongside the head (`buf` keeps the now-unused head and is not
/// meant to be read further by the caller).
pub fn split_head(buf: &mut BytesMut, head: &ResponseHead) -> Bytes {
    buf.split_off(head.consumed).freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_encode_request_verbatim_order() {
        let mut headers = HeaderList::new();
        headers.push("X-Two", b"2".as_slice());
        headers.push("X-One", b"1".as_slice());
        headers.push("X-Two", b"2-again".as_slice());

        let req = WireRequest {
            method: &Method::GET,
            path: "/foo",
            query: Some("a=b"),
            version: Version::HTTP_11,
            headers: &headers,
            body: b"",
        };

        let mut buf = BytesMut::new();
        encode_request(&req, None, &mut buf);

        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("GET /foo?a=b HTTP/1.1\r\n"));
        let head_end = text.find("\r\n\r\n").unwrap();
        let lines: Vec<_> = text[..head_end].split("\r\n").skip(1).collect();
        assert_eq!(lines, vec!["X-Two: 2", "X-One: 1", "X-Two: 2-again"]);
    }

    #[test]
    fn test_decode_head_partial_then_complete() {
        let partial = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(try_decode_head(partial).unwrap().is_none());

        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]);
        let head = try_decode_head(&buf).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(content_length(&head.headers).unwrap(), 2);
        assert!(is_keep_alive(head.version, &head.headers));

        let body = split_head(&mut buf, &head);
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn test_split_head_with_no_trailing_body_bytes() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n"[..]);
        let head = try_decode_head(&buf).unwrap().unwrap();
        let body = split_head(&mut buf, &head);
        assert!(body.is_empty());
    }

    #[test]
    fn test_missing_content_length_is_terminal() {
        let buf = b"HTTP/1.1 200 OK\r\n\r\n";
        let head = try_decode_head(buf).unwrap().unwrap();
        assert!(content_length(&head.headers).is_err());
    }

    #[test]
    fn test_connection_close_not_cacheable() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let head = try_decode_head(buf).unwrap().unwrap();
        assert!(!is_keep_alive(head.version, &head.headers));
    }

    #[test]
    fn test_http10_never_cached() {
        let buf = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n";
        let head = try_decode_head(buf).unwrap().unwrap();
        assert!(!is_keep_alive(head.version, &head.headers));
    }
}
