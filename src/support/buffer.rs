//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Rowmap.
//
// Rowmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rowmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rowmap. If not, see <http://www.gnu.org/licenses/>.

//! The framing buffer between the network reader and the protocol parsers.
//!
//! The buffer is a rope of byte vectors so that appends from the reader and
//! prefix removal by the parser are both cheap. The two extraction
//! operations understand just enough framing to be shared by IMAP and LMTP:
//! whole lines and exact byte counts (IMAP literals). Neither ever blocks;
//! "incomplete" is simply `None` and the caller suspends until the reader
//! appends more.
//!
//! An optional filter chain can be interposed in front of the buffer, e.g.
//! for transparent decompression.

use std::collections::VecDeque;
use std::io;

const CHUNK: usize = 8192;

/// A transformation applied to bytes on their way into the buffer.
pub trait Filter {
    /// Transforms `src`, appending the output to `dst`.
    fn process(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<()>;
}

#[derive(Default)]
pub struct FramingBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Offset of the first unconsumed byte within the first chunk.
    first_used: usize,
    bytes: usize,
    seen_eof: bool,
    error: Option<io::Error>,
    filters: Vec<Box<dyn Filter>>,
}

impl FramingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter to the input chain.
    ///
    /// Filters only apply to data appended after this call; anything already
    /// buffered has been filtered (or not) already.
    #[allow(dead_code)] // no protocol attaches a filter yet
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        0 == self.bytes
    }

    pub fn eof(&self) -> bool {
        self.seen_eof
    }

    pub fn set_eof(&mut self) {
        self.seen_eof = true;
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// Appends data from the network reader, running it through the filter
    /// chain.
    ///
    /// A filter failure latches the error state; further appends are
    /// dropped, and the consumer discovers the condition through
    /// `error()`.
    pub fn append(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if self.filters.is_empty() {
            self.append_raw(data);
            return;
        }

        let mut current = data.to_vec();
        for filter in &mut self.filters {
            let mut next = Vec::with_capacity(current.len());
            if let Err(e) = filter.process(&current, &mut next) {
                self.error = Some(e);
                return;
            }
            current = next;
        }

        self.append_raw(&current);
    }

    fn append_raw(&mut self, data: &[u8]) {
        self.bytes += data.len();

        let mut data = data;
        while !data.is_empty() {
            let need_new = self
                .chunks
                .back()
                .map_or(true, |c| c.len() >= c.capacity());
            if need_new {
                self.chunks.push_back(Vec::with_capacity(CHUNK));
            }

            let back = self.chunks.back_mut().unwrap();
            let n = data.len().min(back.capacity() - back.len());
            back.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
    }

    /// Returns byte `i` (relative to the current read position) without
    /// consuming anything.
    pub fn peek(&self, mut i: usize) -> Option<u8> {
        if i >= self.bytes {
            return None;
        }

        i += self.first_used;
        for chunk in &self.chunks {
            if i < chunk.len() {
                return Some(chunk[i]);
            }
            i -= chunk.len();
        }

        None
    }

    /// Removes and returns one line, excluding its CRLF (or bare LF)
    /// terminator, which is consumed as well.
    ///
    /// Returns `None` if no terminator is buffered yet.
    pub fn remove_line(&mut self) -> Option<Vec<u8>> {
        let mut scanned = 0usize;
        let mut lf = None;
        for (ix, chunk) in self.chunks.iter().enumerate() {
            let slice = if 0 == ix {
                &chunk[self.first_used..]
            } else {
                &chunk[..]
            };
            if let Some(pos) = memchr::memchr(b'\n', slice) {
                lf = Some(scanned + pos);
                break;
            }
            scanned += slice.len();
        }

        let lf = lf?;
        let mut line = self.remove_exact(lf + 1).expect("scanned past end");
        line.pop(); // LF
        if line.last().copied() == Some(b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Removes and returns exactly `n` bytes, or `None` (removing nothing)
    /// if fewer are buffered.
    pub fn remove_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if n > self.bytes {
            return None;
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let take;
            {
                let front = self.chunks.front().expect("byte count out of sync");
                let avail = &front[self.first_used..];
                take = avail.len().min(n - out.len());
                out.extend_from_slice(&avail[..take]);
            }

            self.first_used += take;
            if self.first_used
                >= self.chunks.front().map(Vec::len).unwrap_or(0)
            {
                self.chunks.pop_front();
                self.first_used = 0;
            }
        }

        self.bytes -= n;
        Some(out)
    }
}

/// Transparent DEFLATE decompression, for COMPRESS=DEFLATE-style streams.
#[allow(dead_code)] // no protocol attaches a filter yet
pub struct DeflateFilter {
    decompress: flate2::Decompress,
    out: Vec<u8>,
}

impl DeflateFilter {
    #[allow(dead_code)] // no protocol attaches a filter yet
    pub fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            out: vec![0u8; CHUNK],
        }
    }
}

impl Filter for DeflateFilter {
    fn process(&mut self, mut src: &[u8], dst: &mut Vec<u8>) -> io::Result<()> {
        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress(src, &mut self.out, flate2::FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;

            dst.extend_from_slice(&self.out[..produced]);
            src = &src[consumed..];

            // No progress at all means the decompressor needs more input
            // than we have; 0 produced on empty input means it is drained.
            if 0 == produced && (0 == consumed || src.is_empty()) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lines_and_exact() {
        let mut buffer = FramingBuffer::new();
        assert!(buffer.remove_line().is_none());

        buffer.append(b"a NOOP\r\nb CHECK\nincompl");
        assert_eq!(b"a NOOP".to_vec(), buffer.remove_line().unwrap());
        assert_eq!(b"b CHECK".to_vec(), buffer.remove_line().unwrap());
        assert!(buffer.remove_line().is_none());
        assert_eq!(7, buffer.len());

        buffer.append(b"ete\r\n");
        assert_eq!(b"incomplete".to_vec(), buffer.remove_line().unwrap());
        assert!(buffer.is_empty());

        buffer.append(b"12345rest");
        assert!(buffer.remove_exact(100).is_none());
        assert_eq!(b"12345".to_vec(), buffer.remove_exact(5).unwrap());
        assert_eq!(b"rest".to_vec(), buffer.remove_exact(4).unwrap());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buffer = FramingBuffer::new();
        buffer.append(b"x{5}");
        assert_eq!(Some(b'x'), buffer.peek(0));
        assert_eq!(Some(b'}'), buffer.peek(3));
        assert_eq!(None, buffer.peek(4));
        assert_eq!(4, buffer.len());
    }

    #[test]
    fn line_spanning_chunks() {
        let mut buffer = FramingBuffer::new();
        // Big enough to guarantee multiple chunks.
        let long = vec![b'x'; CHUNK * 2 + 17];
        buffer.append(&long);
        buffer.append(b"\r\ntail\r\n");

        let line = buffer.remove_line().unwrap();
        assert_eq!(long, line);
        assert_eq!(b"tail".to_vec(), buffer.remove_line().unwrap());
    }

    #[test]
    fn crlf_and_bare_lf_both_terminate() {
        let mut buffer = FramingBuffer::new();
        buffer.append(b"dos\r\nunix\n");
        assert_eq!(b"dos".to_vec(), buffer.remove_line().unwrap());
        assert_eq!(b"unix".to_vec(), buffer.remove_line().unwrap());
    }

    struct BrokenFilter;

    impl Filter for BrokenFilter {
        fn process(
            &mut self,
            _: &[u8],
            _: &mut Vec<u8>,
        ) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::InvalidData, "broken"))
        }
    }

    #[test]
    fn eof_and_error_flags() {
        let mut buffer = FramingBuffer::new();
        assert!(!buffer.eof());
        buffer.set_eof();
        assert!(buffer.eof());

        assert!(buffer.error().is_none());
        buffer.add_filter(Box::new(BrokenFilter));
        buffer.append(b"anything");
        assert_eq!("broken", buffer.error().unwrap().to_string());

        // Latched: nothing further is buffered.
        buffer.append(b"more");
        assert!(buffer.is_empty());
    }

    #[test]
    fn deflate_filter_round_trip() {
        use std::io::Write as _;

        let mut compressed = Vec::new();
        let mut encoder = flate2::write::DeflateEncoder::new(
            &mut compressed,
            flate2::Compression::default(),
        );
        encoder.write_all(b"a LOGIN {5}\r\nhello\r\n").unwrap();
        encoder.flush().unwrap();
        drop(encoder);

        let mut buffer = FramingBuffer::new();
        buffer.add_filter(Box::new(DeflateFilter::new()));
        buffer.append(&compressed);
        assert_eq!(b"a LOGIN {5}".to_vec(), buffer.remove_line().unwrap());
        assert_eq!(b"hello".to_vec(), buffer.remove_exact(5).unwrap());
    }
}
