//! Growable read/write byte buffer used by every `TcpConnection`.
//!
//! Layout is `[prepend][readable][writable]`: a cheap-prepend region at the
//! front reserved for headers written after the body is known, readable
//! bytes in the middle, writable space at the end. `read_fd` does a single
//! `readv(2)` into the buffer's writable tail plus a 64KiB stack buffer so
//! one syscall can drain a socket regardless of how much is queued.

use std::io;
use std::os::unix::io::RawFd;

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn begin_read(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    pub fn begin_write_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_index..]
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// `end` is an offset into `begin_read()`, not an absolute buffer index.
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let out = self.buf[self.read_index..self.read_index + len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    /// Returns `Ok(0)` on peer EOF, matching `read(2)` semantics; the caller
    /// (`handleRead`) is the one that turns that into a close.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.begin_write_mut().as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];

        let n = crate::sys::syscall!(readv(fd, iov.as_mut_ptr(), 2))?;
        let n = n as usize;

        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    /// Byte offset of the first `\r\n` in the readable region, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.begin_read().windows(2).position(|w| w == b"\r\n")
    }

    /// Byte offset of the first `\n` in the readable region, if any.
    pub fn find_eol(&self) -> Option<usize> {
        self.begin_read().iter().position(|&b| b == b'\n')
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.retrieve_as_vec(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn find_crlf_locates_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let idx = buf.find_crlf().unwrap();
        assert_eq!(&buf.begin_read()[..idx], b"GET / HTTP/1.1");
    }

    #[test]
    fn growth_slides_before_reallocating() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.retrieve(8);
        let cap_before = buf.buf.len();
        buf.ensure_writable_bytes(10);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 2);
    }

    #[test]
    fn growth_reallocates_when_sliding_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        let cap_before = buf.buf.len();
        buf.ensure_writable_bytes(100);
        assert!(buf.buf.len() > cap_before);
    }

    #[test]
    fn retrieve_all_resets_to_cheap_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"xyz");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }
}
