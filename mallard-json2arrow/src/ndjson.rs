use std::io::{self, BufRead};

/// One non-blank line of a newline delimited JSON stream
#[derive(Debug)]
pub struct Line {
    /// zero based position among non-blank lines
    pub ordinal: u64,
    pub bytes: Vec<u8>,
}

/// Splits a stream into records. Bytes are left undecoded so invalid UTF-8
/// rejects one record rather than failing the stream.
pub struct NdjsonLines<R: BufRead> {
    reader: R,
    next_ordinal: u64,
}

impl<R: BufRead> NdjsonLines<R> {
    pub fn iterator(reader: R) -> Self {
        Self {
            reader,
            next_ordinal: 0,
        }
    }

    fn read_next(&mut self) -> io::Result<Option<Line>> {
        loop {
            let mut bytes = Vec::new();
            if self.reader.read_until(b'\n', &mut bytes)? == 0 {
                return Ok(None);
            }
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            return Ok(Some(Line { ordinal, bytes }));
        }
    }
}

impl<R: BufRead> Iterator for NdjsonLines<R> {
    type Item = io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}
