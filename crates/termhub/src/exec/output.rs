//! Output capture: UTF-8 safe chunking and a bounded retained buffer.

/// Turns a byte stream into `String` chunks without splitting characters.
///
/// Bytes of a character cut off at the end of one read are held back until
/// the next read completes it. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let out = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Number of trailing bytes that start a character not yet complete.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Retains the most recent output of a command up to a byte cap.
#[derive(Debug)]
pub struct OutputBuffer {
    data: String,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a chunk, dropping the oldest bytes beyond the cap.
    pub fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if self.data.len() <= self.cap {
            return;
        }
        let mut cut = self.data.len() - self.cap;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
        self.truncated = true;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether output was dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_holds_back_split_character() {
        let bytes = "héllo".as_bytes();
        let mut chunker = Utf8Chunker::default();
        // Split inside the two-byte 'é'.
        assert_eq!(chunker.push(&bytes[..2]), "h");
        assert_eq!(chunker.push(&bytes[2..]), "éllo");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(b"a\xffb"), "a\u{fffd}b");
        // Dangling lead byte at end of stream.
        assert_eq!(chunker.push(b"c\xe2\x82"), "c");
        assert_eq!(chunker.finish(), "\u{fffd}");
    }

    #[test]
    fn test_buffer_drops_oldest_on_char_boundary() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push("ab");
        assert!(!buffer.truncated());
        buffer.push("cdé");
        assert!(buffer.truncated());
        assert!(buffer.len() <= 4);
        assert_eq!(buffer.into_string(), "cdé");

        let mut buffer = OutputBuffer::new(2);
        buffer.push("aéb");
        // Cutting two bytes would split 'é'; the whole character goes.
        assert_eq!(buffer.into_string(), "b");
    }
}
