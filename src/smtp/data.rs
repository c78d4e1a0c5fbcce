//! Reader for the DATA phase

use std::io::{self, BufRead, Read};

/// Longest chunk pulled from the connection at once. Longer lines are
/// passed through in pieces.
const CHUNK: u64 = 8 * 1024;

/// Yields the message sent after `DATA`, with dot-stuffing removed, and
/// reports end of input at the `<CRLF>.<CRLF>` terminator.
///
/// The terminator is consumed, so the underlying reader is positioned at the
/// next command afterwards. A bare `.` followed by LF is accepted as well.
/// If the connection ends before the terminator, reading fails with
/// `UnexpectedEof`.
pub struct DataReader<R> {
    inner: R,
    line: Vec<u8>,
    pos: usize,
    at_line_start: bool,
    done: bool,
}

impl<R: BufRead> DataReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            pos: 0,
            at_line_start: true,
            done: false,
        }
    }

    /// Whether the terminator has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn fill_line(&mut self) -> io::Result<()> {
        self.line.clear();
        self.pos = 0;

        let read = self
            .inner
            .by_ref()
            .take(CHUNK)
            .read_until(b'\n', &mut self.line)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of data",
            ));
        }

        let starts_line = self.at_line_start;
        self.at_line_start = self.line.ends_with(b"\n");

        if starts_line {
            if self.line == b".\r\n" || self.line == b".\n" {
                self.line.clear();
                self.done = true;
            } else if self.line.starts_with(b".") {
                self.pos = 1;
            }
        }

        Ok(())
    }
}

impl<R: BufRead> Read for DataReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.line.len() {
            if self.done {
                return Ok(0);
            }
            self.fill_line()?;
        }

        let available = &self.line[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
