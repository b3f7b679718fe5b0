//! HTTP/1.1 request parsing.

use super::status::Status;
use crate::stream::Stream;
use std::io;

/// A request read off a [`Stream`]. Parsing never aborts the connection for
/// protocol problems: they are recorded in the status and answered with a
/// minimal error response by the response side.
pub struct HttpRequest {
    status: Status,
    method: String,
    uri: String,
    version: String,
}

impl HttpRequest {
    /// Read one request. `Ok(None)` means the peer closed the connection
    /// cleanly before sending anything; that is not an error and no
    /// response is owed.
    pub fn read(stream: &mut dyn Stream) -> io::Result<Option<Self>> {
        let first_line = stream.next_line()?;
        if first_line.is_empty() {
            return Ok(None);
        }

        let mut request = Self {
            status: Status::ok(),
            method: String::new(),
            uri: String::new(),
            version: String::new(),
        };

        let text = String::from_utf8_lossy(&first_line).into_owned();
        let line = text.strip_suffix("\r\n").unwrap_or(&text);
        match split_request_line(line) {
            Some((method, uri, version)) => {
                request.method = method.to_string();
                request.uri = uri.to_string();
                request.version = version.to_string();
            }
            None => {
                request.status.fail(
                    400,
                    "Bad Request",
                    format!("Badly formatted request line '{line}'"),
                );
                tracing::debug!(target: "nisse::http", line, "bad request line");
                return Ok(Some(request));
            }
        }

        if request.method != "GET" {
            request.status.fail(
                405,
                "Method Not Allowed",
                format!("HTTP method '{}' is not supported", request.method),
            );
            tracing::debug!(target: "nisse::http", method = %request.method, "unsupported method");
            return Ok(Some(request));
        }
        if request.version != "HTTP/1.1" {
            request.status.fail(
                400,
                "Bad Request",
                format!("HTTP version '{}' is not supported", request.version),
            );
            tracing::debug!(target: "nisse::http", version = %request.version, "unsupported version");
            return Ok(Some(request));
        }

        let mut body_size = 0usize;
        while request.status.is_ok() {
            let header = stream.next_line()?;
            if header == b"\r\n" {
                break;
            }
            let text = String::from_utf8_lossy(&header).into_owned();
            let line = text.strip_suffix("\r\n").unwrap_or(&text);
            match split_header(line) {
                Some((name, value)) => {
                    if name.eq_ignore_ascii_case("content-length") {
                        match value.trim_start().parse::<usize>() {
                            Ok(size) => body_size = size,
                            Err(_) => request.status.fail(
                                400,
                                "Bad Request",
                                format!("Invalid content-length '{}'", value.trim()),
                            ),
                        }
                    }
                }
                None => {
                    request.status.fail(
                        400,
                        "Bad Request",
                        format!("HTTP message header badly formatted '{line}'"),
                    );
                    tracing::debug!(target: "nisse::http", header = line, "bad header");
                }
            }
        }
        if !request.status.is_ok() {
            return Ok(Some(request));
        }

        // GET carries no useful body; whatever was announced is discarded.
        stream.ignore(body_size)?;
        tracing::debug!(
            target: "nisse::http",
            method = %request.method,
            uri = %request.uri,
            body = body_size,
            "request parsed"
        );
        Ok(Some(request))
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_ok()
    }
}

/// Split `GET /x HTTP/1.1` on its two separating spaces. Anything after the
/// second space belongs to the version field, which the version check then
/// rejects if it contains garbage.
fn split_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().filter(|s| !s.is_empty())?;
    let uri = parts.next().filter(|s| !s.is_empty())?;
    let version = parts.next().filter(|s| !s.is_empty())?;
    Some((method, uri, version))
}

/// Split a header at the first `:`. The value keeps its bytes verbatim,
/// leading whitespace included.
fn split_header(line: &str) -> Option<(&str, &str)> {
    let sep = line.find(':')?;
    Some((&line[..sep], &line[sep + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::MemoryStream;

    fn read(input: &[u8]) -> HttpRequest {
        let mut stream = MemoryStream::new(input);
        HttpRequest::read(&mut stream)
            .unwrap()
            .expect("request expected")
    }

    #[test]
    fn request_line_round_trips() {
        let request = read(b"GET /x HTTP/1.1\r\n\r\n");
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), "/x");
        assert_eq!(request.version(), "HTTP/1.1");
        assert!(request.is_valid());
    }

    #[test]
    fn header_value_keeps_leading_whitespace() {
        assert_eq!(split_header("k: v"), Some(("k", " v")));
        assert_eq!(split_header("k:v"), Some(("k", "v")));
        assert_eq!(split_header("no separator"), None);
    }

    #[test]
    fn post_is_method_not_allowed() {
        let request = read(b"POST / HTTP/1.1\r\n\r\n");
        assert_eq!(request.status().code(), 405);
        assert_eq!(
            request.status().information(),
            "HTTP method 'POST' is not supported"
        );
    }

    #[test]
    fn wrong_version_is_bad_request() {
        let request = read(b"GET / HTTP/2.0\r\n\r\n");
        assert_eq!(request.status().code(), 400);
        assert_eq!(
            request.status().information(),
            "HTTP version 'HTTP/2.0' is not supported"
        );
    }

    #[test]
    fn short_request_line_is_bad_request() {
        let request = read(b"GET\r\n\r\n");
        assert_eq!(request.status().code(), 400);
    }

    #[test]
    fn header_without_colon_is_bad_request() {
        let request = read(b"GET / HTTP/1.1\r\nbogus header\r\n\r\n");
        assert_eq!(request.status().code(), 400);
        assert_eq!(
            request.status().information(),
            "HTTP message header badly formatted 'bogus header'"
        );
    }

    #[test]
    fn content_length_is_recognized_case_insensitively() {
        let mut stream = MemoryStream::new(b"GET / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /next HTTP/1.1\r\n\r\n");
        let first = HttpRequest::read(&mut stream).unwrap().unwrap();
        assert!(first.is_valid());

        // The body was consumed; the next request starts cleanly.
        let second = HttpRequest::read(&mut stream).unwrap().unwrap();
        assert_eq!(second.uri(), "/next");
    }

    #[test]
    fn zero_content_length_consumes_nothing() {
        let mut stream =
            MemoryStream::new(b"GET / HTTP/1.1\r\ncontent-length: 0\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = HttpRequest::read(&mut stream).unwrap().unwrap();
        assert!(first.is_valid());
        let second = HttpRequest::read(&mut stream).unwrap().unwrap();
        assert_eq!(second.uri(), "/b");
    }

    #[test]
    fn unparsable_content_length_is_bad_request() {
        let request = read(b"GET / HTTP/1.1\r\ncontent-length: many\r\n\r\n");
        assert_eq!(request.status().code(), 400);
    }

    #[test]
    fn clean_eof_is_no_request() {
        let mut stream = MemoryStream::new(b"");
        assert!(HttpRequest::read(&mut stream).unwrap().is_none());
    }
}
