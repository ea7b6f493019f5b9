//! HTTP request/response surface of the shared listener.
//!
//! Request parsing is delegated to `httparse`; this module only owns the
//! accumulation loop (a request may arrive in arbitrary slices) and the
//! small typed view the manager consumes: method, url, header map.
//! Responses are plain HTTP/1.1 with a JSON body and a uniform 200 status
//! for API answers; the `status` field in the body is authoritative.

use bytes::{Bytes, BytesMut};

use crate::frame::FrameError;

/// Headers per request we are prepared to parse.
const MAX_HEADERS: usize = 64;

/// Accumulation cap for one request (headers + declared body).
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

/// A complete parsed request: the `(method, url, header-map)` interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Extension of the url path, e.g. `css` for `/style/main.css`.
    pub fn format(&self) -> Option<&str> {
        let path = self.url.split('?').next().unwrap_or(&self.url);
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        (!ext.is_empty()).then_some(ext)
    }

    /// Try to parse one request from the front of `buf`. On success the
    /// consumed bytes are split off and the request returned; `None` means
    /// more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(buf.as_ref())?;
        let header_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > MAX_REQUEST_LEN {
                    return Err(FrameError::HttpTooLarge);
                }
                return Ok(None);
            }
        };

        let parsed_headers: Vec<(String, String)> = req
            .headers
            .iter()
            .map(|h| {
                let value = std::str::from_utf8(h.value)
                    .map_err(|_| FrameError::InvalidUtf8("http header"))?;
                Ok((h.name.to_string(), value.to_string()))
            })
            .collect::<Result<_, FrameError>>()?;

        let body_len = parsed_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let total = header_len + body_len;
        if total > MAX_REQUEST_LEN {
            return Err(FrameError::HttpTooLarge);
        }
        if buf.len() < total {
            return Ok(None);
        }

        let request = Self {
            method: req.method.unwrap_or("").to_string(),
            url: req.path.unwrap_or("").to_string(),
            headers: parsed_headers,
        };
        let _ = buf.split_to(total);
        Ok(Some(request))
    }
}

/// Response construction. All API answers are 200 with a JSON body.
pub struct HttpResponse;

impl HttpResponse {
    pub fn json(body: &serde_json::Value) -> Bytes {
        Self::raw_json(&body.to_string())
    }

    pub fn raw_json(body: &str) -> Bytes {
        Bytes::from(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
            body.len(),
            body
        ))
    }

    /// The uniform error shape: `{"status":false,"message":…}`.
    pub fn negative(message: &str) -> Bytes {
        Self::json(&serde_json::json!({ "status": false, "message": message }))
    }

    pub fn not_found() -> Bytes {
        let body = "404 Not Found";
        Bytes::from(format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
            body.len(),
            body
        ))
    }

    pub fn file(content_type: &str, content: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(content.len() + 128);
        out.extend_from_slice(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
                content_type,
                content.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(content);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_simple_get() {
        let mut buf = BytesMut::from(
            &b"GET /api HTTP/1.1\r\nHost: x\r\nType: getInstalledApps\r\n\r\n"[..],
        );
        let req = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/api");
        assert_eq!(req.header("type"), Some("getInstalledApps"));
        assert_eq!(req.header("TYPE"), Some("getInstalledApps"));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_request_needs_more() {
        let mut buf = BytesMut::from(&b"GET /api HTTP/1.1\r\nHos"[..]);
        assert_eq!(HttpRequest::parse(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"t: x\r\n\r\n");
        assert!(HttpRequest::parse(&mut buf).unwrap().is_some());
    }

    #[test]
    fn pipelined_requests_parse_one_at_a_time() {
        let one = b"GET /a HTTP/1.1\r\n\r\n";
        let two = b"GET /b HTTP/1.1\r\n\r\n";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(one);
        buf.extend_from_slice(two);
        let first = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.url, "/a");
        let second = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(second.url, "/b");
        assert!(buf.is_empty());
    }

    #[test]
    fn body_consumed_via_content_length() {
        let mut buf = BytesMut::from(
            &b"GET /api HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcdGET /x HTTP/1.1\r\n\r\n"[..],
        );
        let first = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.url, "/api");
        let second = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(second.url, "/x");
    }

    #[test]
    fn format_extension() {
        let mut buf = BytesMut::from(&b"GET /style/main.css HTTP/1.1\r\n\r\n"[..]);
        let req = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(req.format(), Some("css"));

        let mut buf = BytesMut::from(&b"GET /api HTTP/1.1\r\n\r\n"[..]);
        let req = HttpRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(req.format(), None);
    }

    #[test]
    fn negative_response_shape() {
        let bytes = HttpResponse::negative("Unknown app type: X");
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("{\"message\":\"Unknown app type: X\",\"status\":false}"));
    }
}
