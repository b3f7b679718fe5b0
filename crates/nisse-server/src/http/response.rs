//! Response writing and path resolution.

use super::request::HttpRequest;
use super::status::Status;
use crate::stream::Stream;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// How much file data is flushed to the stream at a time.
const FILE_CHUNK: usize = 64 * 1024;

/// Response to one request. Inherits the request's status and may move it
/// to 400/404 during path resolution; it can never move back to 200.
pub struct HttpResponse {
    status: Status,
}

impl HttpResponse {
    pub fn new(request: &HttpRequest) -> Self {
        Self {
            status: request.status().clone(),
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Resolve the request's target and write the full response. For non-200
    /// outcomes the body is empty and the diagnostic goes into a `message:`
    /// header.
    pub fn send(
        &mut self,
        stream: &mut dyn Stream,
        request: &HttpRequest,
        content_root: &Path,
    ) -> io::Result<()> {
        let file_path = self.resolve_path(request, content_root);

        let Some(path) = file_path else {
            stream.send_message(
                format!(
                    "HTTP/1.1 {} {}\r\n",
                    self.status.code(),
                    self.status.message()
                )
                .as_bytes(),
            );
            stream.send_message(format!("message: {}\r\n", self.status.information()).as_bytes());
            stream.send_message(b"content-length: 0\r\n");
            stream.send_message(b"\r\n");
            stream.sync()?;
            tracing::info!(
                target: "nisse::http",
                code = self.status.code(),
                message = self.status.message(),
                uri = %request.uri(),
                "response sent"
            );
            return Ok(());
        };

        let file_size = fs::metadata(&path)?.len();
        stream.send_message(b"HTTP/1.1 200 OK\r\n");
        stream.send_message(format!("content-length: {file_size}\r\n").as_bytes());
        stream.send_message(b"\r\n");

        // Flush per chunk: bounded memory, and large bodies exercise the
        // write-readiness path.
        let mut file = File::open(&path)?;
        let mut chunk = vec![0u8; FILE_CHUNK];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            stream.send_message(&chunk[..n]);
            stream.sync()?;
        }
        stream.sync()?;
        tracing::info!(
            target: "nisse::http",
            code = 200u16,
            uri = %request.uri(),
            size = file_size,
            "response sent"
        );
        Ok(())
    }

    /// Map the request URI onto a regular file under `content_root`, which
    /// must already be canonical. `None` means the status now says why not.
    fn resolve_path(&mut self, request: &HttpRequest, content_root: &Path) -> Option<PathBuf> {
        if !self.status.is_ok() {
            return None;
        }

        let uri = request.uri();
        let normalized = lexically_normal(Path::new(uri));
        if uri.is_empty() || normalized.starts_with("..") {
            self.status.fail(
                400,
                "Bad Request",
                format!("Invalid Request Path: {uri}"),
            );
            tracing::debug!(target: "nisse::http", uri, "invalid request path");
            return None;
        }

        // An empty normalized path means the root itself, which is a
        // directory and picks up index.html below.
        let mut path = match fs::canonicalize(content_root.join(&normalized)) {
            Ok(path) => path,
            Err(_) => {
                self.not_found(uri);
                return None;
            }
        };
        if path.is_dir() {
            path = match fs::canonicalize(path.join("index.html")) {
                Ok(path) => path,
                Err(_) => {
                    self.not_found(uri);
                    return None;
                }
            };
        }
        if !path.starts_with(content_root) {
            // Reachable only through a symlink pointing out of the root.
            self.status.fail(
                400,
                "Bad Request",
                format!("Invalid Request Path: {uri}"),
            );
            tracing::debug!(target: "nisse::http", uri, "path escapes content root");
            return None;
        }
        if !path.is_file() {
            self.not_found(uri);
            return None;
        }

        tracing::debug!(target: "nisse::http", uri, path = %path.display(), "resolved");
        Some(path)
    }

    fn not_found(&mut self, uri: &str) {
        self.status
            .fail(404, "Not Found", format!("No file found at: {uri}"));
        tracing::debug!(target: "nisse::http", uri, "no such file");
    }
}

/// Collapse `.` and `..` components without touching the filesystem. Root
/// and prefix components are dropped: the result is always relative. `..`
/// components that would climb above the start are kept, so callers can
/// detect escapes with `starts_with("..")`.
fn lexically_normal(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                let escapes = matches!(
                    normal.components().next_back(),
                    Some(Component::ParentDir) | None
                );
                if escapes {
                    normal.push("..");
                } else {
                    normal.pop();
                }
            }
            Component::Normal(part) => normal.push(part),
        }
    }
    normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::MemoryStream;
    use crate::http::request::HttpRequest;

    fn request_for(input: &[u8]) -> HttpRequest {
        let mut stream = MemoryStream::new(input);
        HttpRequest::read(&mut stream).unwrap().unwrap()
    }

    fn respond(uri: &str, root: &Path) -> (u16, String) {
        let request = request_for(format!("GET {uri} HTTP/1.1\r\n\r\n").as_bytes());
        let mut response = HttpResponse::new(&request);
        let mut stream = MemoryStream::new(b"");
        response.send(&mut stream, &request, root).unwrap();
        (response.status().code(), stream.output_str())
    }

    fn content_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/page.html"), "subpage").unwrap();
        dir
    }

    fn canonical(dir: &tempfile::TempDir) -> PathBuf {
        fs::canonicalize(dir.path()).unwrap()
    }

    #[test]
    fn normalizes_dot_and_dotdot() {
        assert_eq!(lexically_normal(Path::new("/a/./b")), PathBuf::from("a/b"));
        assert_eq!(lexically_normal(Path::new("a/b/../c")), PathBuf::from("a/c"));
        assert_eq!(lexically_normal(Path::new("/")), PathBuf::new());
        assert_eq!(
            lexically_normal(Path::new("/../etc/passwd")),
            PathBuf::from("../etc/passwd")
        );
        assert_eq!(
            lexically_normal(Path::new("a/../../b")),
            PathBuf::from("../b")
        );
    }

    #[test]
    fn serves_a_regular_file() {
        let dir = content_root();
        let (code, output) = respond("/index.html", &canonical(&dir));
        assert_eq!(code, 200);
        assert_eq!(output, "HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nhi\n");
    }

    #[test]
    fn root_uri_picks_up_index_html() {
        let dir = content_root();
        let (code, output) = respond("/", &canonical(&dir));
        assert_eq!(code, 200);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\n"));
    }

    #[test]
    fn directory_uri_picks_up_its_index() {
        let dir = content_root();
        std::fs::write(dir.path().join("sub/index.html"), "subindex").unwrap();
        let (code, output) = respond("/sub", &canonical(&dir));
        assert_eq!(code, 200);
        assert!(output.ends_with("subindex"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = content_root();
        let (code, output) = respond("/missing", &canonical(&dir));
        assert_eq!(code, 404);
        assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(output.contains("message: No file found at: /missing\r\n"));
        assert!(output.contains("content-length: 0\r\n"));
    }

    #[test]
    fn traversal_is_rejected_before_touching_the_filesystem() {
        let dir = content_root();
        let (code, output) = respond("/../etc/passwd", &canonical(&dir));
        assert_eq!(code, 400);
        assert!(output.contains("message: Invalid Request Path: /../etc/passwd\r\n"));
    }

    #[test]
    fn bare_dotdot_is_rejected() {
        let dir = content_root();
        let (code, _) = respond("/..", &canonical(&dir));
        assert_eq!(code, 400);
    }

    #[test]
    fn non_200_request_status_is_passed_through() {
        let dir = content_root();
        let request = request_for(b"POST / HTTP/1.1\r\n\r\n");
        let mut response = HttpResponse::new(&request);
        let mut stream = MemoryStream::new(b"");
        response.send(&mut stream, &request, &canonical(&dir)).unwrap();

        assert_eq!(
            stream.output_str(),
            "HTTP/1.1 405 Method Not Allowed\r\n\
             message: HTTP method 'POST' is not supported\r\n\
             content-length: 0\r\n\
             \r\n"
        );
    }

    #[test]
    fn status_never_goes_back_to_ok() {
        let dir = content_root();
        let request = request_for(b"GET /missing HTTP/1.1\r\n\r\n");
        let mut response = HttpResponse::new(&request);
        let mut stream = MemoryStream::new(b"");
        response.send(&mut stream, &request, &canonical(&dir)).unwrap();
        assert_eq!(response.status().code(), 404);

        // A second resolution attempt cannot resurrect the response.
        assert!(response
            .resolve_path(&request_for(b"GET /index.html HTTP/1.1\r\n\r\n"), &canonical(&dir))
            .is_none());
        assert_eq!(response.status().code(), 404);
    }
}
