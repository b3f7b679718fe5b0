//! # HTTP engine
//!
//! Request parsing, path resolution and response writing for the GET-only
//! HTTP/1.1 subset nisse speaks. Everything here is written against the
//! [`Stream`] trait in blocking style; suspension on a slow socket is the
//! stream's business, not the engine's.

mod request;
mod response;
mod status;

pub use request::HttpRequest;
pub use response::HttpResponse;
pub use status::Status;

use crate::stream::Stream;
use std::path::Path;

/// Serve requests off one connection until the peer stops sending, an error
/// response closes the stream, or the transport drops.
///
/// This is the body of every connection coroutine.
pub fn serve_connection(stream: &mut dyn Stream, content_root: &Path) {
    while stream.has_data() {
        let request = match HttpRequest::read(stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "nisse::http", error = %e, "read failed");
                break;
            }
        };
        let mut response = HttpResponse::new(&request);
        if let Err(e) = response.send(stream, &request, content_root) {
            tracing::warn!(target: "nisse::http", error = %e, "response failed");
            break;
        }
        if !response.is_ok() {
            // Anything still on the stream after a failed request is
            // suspect; drop the connection.
            stream.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::MemoryStream;
    use std::path::PathBuf;

    fn content_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "AAA").unwrap();
        std::fs::write(dir.path().join("b.txt"), "BB").unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        (dir, canonical)
    }

    #[test]
    fn serves_index_for_root_request() {
        let (_dir, root) = content_root();
        let mut stream = MemoryStream::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        serve_connection(&mut stream, &root);

        assert!(stream
            .output_str()
            .starts_with("HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nhi\n"));
        assert!(!stream.was_closed());
    }

    #[test]
    fn answers_back_to_back_requests_in_order() {
        let (_dir, root) = content_root();
        let mut stream = MemoryStream::new(
            b"GET /a.txt HTTP/1.1\r\n\r\nGET /b.txt HTTP/1.1\r\n\r\n",
        );
        serve_connection(&mut stream, &root);

        assert_eq!(
            stream.output_str(),
            "HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nAAA\
             HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nBB"
        );
    }

    #[test]
    fn error_response_closes_the_connection() {
        let (_dir, root) = content_root();
        // The second request would be valid, but the 404 closes the stream
        // before it is read.
        let mut stream = MemoryStream::new(
            b"GET /missing HTTP/1.1\r\n\r\nGET /a.txt HTTP/1.1\r\n\r\n",
        );
        serve_connection(&mut stream, &root);

        assert!(stream.output_str().starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(stream.was_closed());
        assert!(!stream.output_str().contains("200 OK"));
    }

    #[test]
    fn empty_connection_produces_no_output() {
        let (_dir, root) = content_root();
        let mut stream = MemoryStream::new(b"");
        serve_connection(&mut stream, &root);
        assert!(stream.output.is_empty());
        assert!(!stream.was_closed());
    }
}
