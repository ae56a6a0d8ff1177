//! Per-connection HTTP/1.1 parse-and-respond state machine, attached to a
//! `TcpConnection` via its context slot. Grounded on `HttpConnection.h/.cc`.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::http::mime;
use crate::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseState {
    RequestLine,
    Header,
    Body,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpCode {
    NoRequest,
    GetRequest,
    BadRequest,
    Forbidden,
    NoResource,
}

impl From<HttpCode> for Option<ProtocolError> {
    fn from(code: HttpCode) -> Option<ProtocolError> {
        match code {
            HttpCode::BadRequest => Some(ProtocolError::BadRequest),
            HttpCode::Forbidden => Some(ProtocolError::Forbidden),
            HttpCode::NoResource => Some(ProtocolError::NotFound),
            _ => None,
        }
    }
}

pub struct Connection {
    parse_state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: IndexMap<String, String>,
    body: Vec<u8>,
    post: IndexMap<String, String>,
    response_code: i32,
    keep_alive: bool,
    stat: Option<std::fs::Metadata>,
    source_dir: PathBuf,
    pub(crate) timer_id: Option<TimerId>,
}

impl Connection {
    pub fn new(source_dir: PathBuf) -> Connection {
        Connection {
            parse_state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: IndexMap::new(),
            body: Vec::new(),
            post: IndexMap::new(),
            response_code: -1,
            keep_alive: false,
            stat: None,
            source_dir,
            timer_id: None,
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn post_fields(&self) -> &IndexMap<String, String> {
        &self.post
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.source_dir.join(path.trim_start_matches('/'))
    }

    /// Drains as much of `buf` as forms complete parse units, returning
    /// `NoRequest` when more bytes are needed.
    pub(crate) fn parse_request(&mut self, buf: &mut Buffer) -> HttpCode {
        while self.parse_state != ParseState::Finish {
            let line: Vec<u8>;

            if self.parse_state == ParseState::Body {
                let content_length = self.content_length();
                let remain = content_length.saturating_sub(self.body.len());
                if buf.readable_bytes() < remain {
                    return HttpCode::NoRequest;
                }
                line = buf.retrieve_as_vec(remain);
            } else {
                let Some(pos) = buf.find_crlf() else {
                    return HttpCode::NoRequest;
                };
                line = buf.retrieve_as_vec(pos);
                buf.retrieve(2);
            }

            let ret = match self.parse_state {
                ParseState::RequestLine => self.parse_request_line(&line),
                ParseState::Header => self.parse_request_header(&line),
                ParseState::Body => self.parse_request_body(&line),
                ParseState::Finish => unreachable!(),
            };
            if ret != HttpCode::NoRequest {
                return ret;
            }
        }

        HttpCode::GetRequest
    }

    fn content_length(&self) -> usize {
        self.headers.get("Content-Length").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> HttpCode {
        let line = String::from_utf8_lossy(line);
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return HttpCode::BadRequest;
        };
        let Some(version) = version.strip_prefix("HTTP/") else {
            return HttpCode::BadRequest;
        };

        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.parse_state = ParseState::Header;

        if self.path == "/" {
            self.path.push_str("index.html");
        } else if !self.path.contains('.') {
            self.path.push_str(".html");
        }

        self.stat_and_check(&self.path.clone())
    }

    fn stat_and_check(&mut self, path: &str) -> HttpCode {
        match std::fs::metadata(self.resolve(path)) {
            Ok(meta) if meta.is_dir() => HttpCode::NoResource,
            Ok(meta) => {
                if meta.permissions().mode() & 0o004 == 0 {
                    HttpCode::Forbidden
                } else {
                    self.stat = Some(meta);
                    HttpCode::NoRequest
                }
            }
            Err(_) => HttpCode::NoResource,
        }
    }

    fn parse_request_header(&mut self, line: &[u8]) -> HttpCode {
        if line.is_empty() {
            if self.content_length() == 0 {
                self.parse_state = ParseState::Finish;
                HttpCode::GetRequest
            } else {
                self.parse_state = ParseState::Body;
                HttpCode::NoRequest
            }
        } else {
            let line = String::from_utf8_lossy(line);
            let Some((name, value)) = line.split_once(':') else {
                return HttpCode::BadRequest;
            };
            let value = value.trim_start();
            if name.is_empty() || value.is_empty() {
                return HttpCode::BadRequest;
            }
            self.headers.insert(name.to_string(), value.to_string());
            HttpCode::NoRequest
        }
    }

    fn parse_request_body(&mut self, line: &[u8]) -> HttpCode {
        self.body.extend_from_slice(line);
        let content_length = self.content_length();
        if self.body.len() < content_length {
            return HttpCode::NoRequest;
        } else if self.body.len() > content_length {
            return HttpCode::BadRequest;
        }

        if self.method == "POST" {
            let ret = self.parse_post();
            if ret != HttpCode::NoRequest {
                return ret;
            }
            let ret = self.user_verify();
            if ret != HttpCode::NoRequest {
                return ret;
            }
        }

        self.parse_state = ParseState::Finish;
        HttpCode::GetRequest
    }

    fn parse_post(&mut self) -> HttpCode {
        if self.body.is_empty() {
            return HttpCode::NoRequest;
        }
        let Some(content_type) = self.headers.get("Content-Type") else {
            return HttpCode::BadRequest;
        };
        if content_type == "application/x-www-form-urlencoded" {
            return self.parse_form_urlencoded();
        }
        HttpCode::NoRequest
    }

    fn parse_form_urlencoded(&mut self) -> HttpCode {
        let body = self.body.clone();
        let mut key: Vec<u8> = Vec::new();
        let mut value: Vec<u8> = Vec::new();
        let mut in_value = false;

        let n = body.len();
        let mut i = 0;
        while i < n {
            match body[i] {
                b'=' => in_value = true,
                b'&' => {
                    if key.is_empty() || value.is_empty() {
                        return HttpCode::BadRequest;
                    }
                    self.post.insert(
                        String::from_utf8_lossy(&key).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    );
                    key.clear();
                    value.clear();
                    in_value = false;
                }
                b'+' => {
                    if in_value { value.push(b' ') } else { key.push(b' ') }
                }
                b'%' => {
                    if i + 2 >= n {
                        return HttpCode::BadRequest;
                    }
                    let hex = std::str::from_utf8(&body[i + 1..i + 3])
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok());
                    let Some(byte) = hex else {
                        return HttpCode::BadRequest;
                    };
                    if in_value { value.push(byte) } else { key.push(byte) }
                    i += 2;
                }
                b => {
                    if in_value { value.push(b) } else { key.push(b) }
                }
            }
            i += 1;
        }

        if key.is_empty() || value.is_empty() {
            return HttpCode::BadRequest;
        }
        self.post.insert(
            String::from_utf8_lossy(&key).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        );

        tracing::info!(fields = ?self.post, "decoded POST form");
        HttpCode::NoRequest
    }

    /// Placeholder, preserved bit-for-bit: rewrites the path to
    /// `welcome.html` for `register.html`/`login.html`, `error.html`
    /// otherwise, without consulting any credential store.
    fn user_verify(&mut self) -> HttpCode {
        self.path = if self.path.contains("register.html") || self.path.contains("login.html") {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };

        match std::fs::metadata(self.resolve(&self.path.clone())) {
            Ok(meta) => {
                self.stat = Some(meta);
                HttpCode::NoRequest
            }
            Err(_) => HttpCode::NoResource,
        }
    }

    pub(crate) fn make_response(&mut self, out: &mut Buffer, parse_ret: HttpCode) {
        self.init_response(parse_ret);
        self.make_response_line(out);
        self.make_response_header(out);
        self.make_response_body(out);
    }

    fn init_response(&mut self, code: HttpCode) {
        self.response_code = match code {
            HttpCode::GetRequest => 200,
            HttpCode::BadRequest => 400,
            HttpCode::Forbidden => 403,
            HttpCode::NoResource => 404,
            HttpCode::NoRequest => 400,
        };

        if self.response_code != 200 {
            self.path = format!("/{}.html", self.response_code);
            match std::fs::metadata(self.resolve(&self.path.clone())) {
                Ok(meta) => self.stat = Some(meta),
                Err(e) => crate::error::fatal("stat error page (operator must provide it)", &e),
            }
        }
    }

    fn make_response_line(&self, out: &mut Buffer) {
        out.append(format!("HTTP/1.1 {} {}\r\n", self.response_code, mime::reason_phrase(self.response_code)).as_bytes());
    }

    fn make_response_header(&mut self, out: &mut Buffer) {
        out.append(b"Connection: ");
        let requested_keep_alive =
            self.headers.get("Connection").map(|v| v == "keep-alive").unwrap_or(false) && self.version == "1.1";
        if requested_keep_alive {
            self.keep_alive = true;
            out.append(b"keep-alive\r\n");
            out.append(b"Keep-Alive: max=6, timeout=120\r\n");
        } else {
            self.keep_alive = false;
            out.append(b"close\r\n");
        }

        out.append(b"Content-Type: ");
        out.append(mime::lookup(&self.path).as_bytes());
        out.append(b"\r\n");

        let len = self.stat.as_ref().map(|m| std::os::unix::fs::MetadataExt::size(m)).unwrap_or(0);
        out.append(format!("Content-Length: {len}\r\n").as_bytes());
        out.append(b"\r\n");
    }

    fn make_response_body(&self, out: &mut Buffer) {
        let len = self.stat.as_ref().map(|m| std::os::unix::fs::MetadataExt::size(m)).unwrap_or(0) as usize;
        if len == 0 {
            return;
        }

        let file = match std::fs::File::open(self.resolve(&self.path)) {
            Ok(f) => f,
            Err(e) => crate::error::fatal("open response body", &e),
        };

        let addr = unsafe { libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, file.as_raw_fd(), 0) };
        drop(file);
        if addr == libc::MAP_FAILED {
            crate::error::fatal("mmap response body", &std::io::Error::last_os_error());
        }

        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        out.append(bytes);

        if unsafe { libc::munmap(addr, len) } < 0 {
            tracing::error!(error = %std::io::Error::last_os_error(), "munmap failed");
        }
    }

    pub(crate) fn reset_state(&mut self) {
        self.parse_state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
        self.response_code = -1;
        self.stat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("reactord-http-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), b"<h1>Hi</h1>").unwrap();
        std::fs::write(dir.join("400.html"), b"bad").unwrap();
        std::fs::write(dir.join("403.html"), b"forbidden").unwrap();
        std::fs::write(dir.join("404.html"), b"missing").unwrap();
        dir
    }

    #[test]
    fn parses_request_line_and_rewrites_root_path() {
        let dir = fixture_dir();
        let mut conn = Connection::new(dir);
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let ret = conn.parse_request(&mut buf);
        assert_eq!(ret, HttpCode::GetRequest);
        assert_eq!(conn.path, "/index.html");
    }

    #[test]
    fn missing_content_length_skips_body_phase() {
        let dir = fixture_dir();
        let mut conn = Connection::new(dir);
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(conn.parse_request(&mut buf), HttpCode::GetRequest);
    }

    #[test]
    fn malformed_request_line_is_bad_request() {
        let dir = fixture_dir();
        let mut conn = Connection::new(dir);
        let mut buf = Buffer::new();
        buf.append(b"NOTHTTP\r\n\r\n");
        assert_eq!(conn.parse_request(&mut buf), HttpCode::BadRequest);
    }

    #[test]
    fn missing_resource_is_no_resource() {
        let dir = fixture_dir();
        let mut conn = Connection::new(dir);
        let mut buf = Buffer::new();
        buf.append(b"GET /missing HTTP/1.1\r\n\r\n");
        assert_eq!(conn.parse_request(&mut buf), HttpCode::NoResource);
    }

    #[test]
    fn urlencoded_post_decodes_percent_and_plus() {
        let dir = fixture_dir();
        std::fs::write(dir.join("welcome.html"), b"ok").unwrap();
        let mut conn = Connection::new(dir);
        let mut buf = Buffer::new();
        buf.append(b"POST /login.html HTTP/1.1\r\n");
        buf.append(b"Content-Length: 17\r\n");
        buf.append(b"Content-Type: application/x-www-form-urlencoded\r\n");
        buf.append(b"\r\n");
        buf.append(b"user=a&pass=b%2Bc");
        let ret = conn.parse_request(&mut buf);
        assert_eq!(ret, HttpCode::GetRequest);
        assert_eq!(conn.post_fields().get("user").map(String::as_str), Some("a"));
        assert_eq!(conn.post_fields().get("pass").map(String::as_str), Some("b+c"));
        assert_eq!(conn.path, "/welcome.html");
    }

    #[test]
    fn keep_alive_response_advertises_keep_alive_header() {
        let dir = fixture_dir();
        let mut conn = Connection::new(dir);
        conn.headers.insert("Connection".to_string(), "keep-alive".to_string());
        conn.version = "1.1".to_string();
        conn.path = "/index.html".to_string();
        conn.stat = Some(std::fs::metadata(conn.resolve("/index.html")).unwrap());
        let mut out = Buffer::new();
        conn.make_response(&mut out, HttpCode::GetRequest);
        let rendered = String::from_utf8(out.retrieve_all_as_vec()).unwrap();
        assert!(rendered.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(rendered.contains("Keep-Alive: max=6, timeout=120\r\n"));
        assert!(rendered.contains("<h1>Hi</h1>"));
        assert!(conn.keep_alive());
    }
}
