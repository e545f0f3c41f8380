//! Chunked byte source for the lexer.

use std::io::{self, ErrorKind, Read};

use crate::consts::READER_CHUNK;

/// Pull source of bytes.
///
/// Reads fixed-size chunks from any [`Read`] implementation and hands them
/// out one byte at a time; chunk boundaries are invisible to the consumer.
/// A read of zero bytes signals end of input.
#[derive(Debug)]
pub struct Reader<R> {
    src: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> Reader<R> {
    /// Wraps a byte source.
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: Vec::with_capacity(READER_CHUNK),
            pos: 0,
            eof: false,
        }
    }

    /// Next byte, or `None` at end of input.
    pub fn next(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.buf.len() && !self.fill()? {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    /// Pulls the next chunk; returns false at end of input.
    fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.buf.resize(READER_CHUNK, 0);
        self.pos = 0;
        loop {
            match self.src.read(&mut self.buf) {
                Ok(0) => {
                    self.buf.clear();
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.truncate(n);
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
