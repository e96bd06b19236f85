use crate::constants::TRUNCATION_MARKER;

/// In-memory replacement for one output stream.
///
/// Holds at most `cap` characters. The write that crosses the cap is cut at
/// the boundary, the truncation marker is appended once, and every later
/// write is dropped.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Default::default()
        }
    }

    /// Appends `chunk`. Returns `false` when the chunk did not fit entirely.
    pub fn push(&mut self, chunk: &str) -> bool {
        if self.truncated {
            return false;
        }

        let len = chunk.chars().count();
        if self.chars + len <= self.cap {
            self.text.push_str(chunk);
            self.chars += len;
            return true;
        }

        let room = self.cap - self.chars;
        self.text.extend(chunk.chars().take(room));
        self.text.push_str(TRUNCATION_MARKER);
        self.chars = self.cap;
        self.truncated = true;
        false
    }

    /// Takes the captured text and leaves an empty buffer with a new cap.
    pub fn reset(&mut self, cap: usize) -> String {
        std::mem::replace(self, Self::new(cap)).text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_cap() {
        let mut buf = OutputBuffer::new(10);
        assert!(buf.push("hello"));
        assert!(buf.push("12345"));
        assert!(!buf.truncated);
        assert_eq!(buf.reset(10), "hello12345");
    }

    #[test]
    fn test_cap_crossing_write_is_cut_and_marked_once() {
        let mut buf = OutputBuffer::new(8);
        assert!(buf.push("abcde"));
        assert!(!buf.push("fghij"));
        assert!(!buf.push("klm"));
        assert!(!buf.push(""));

        let expected = format!("abcdefgh{TRUNCATION_MARKER}");
        let text = buf.reset(8);
        assert_eq!(text, expected);
        assert_eq!(text.matches(TRUNCATION_MARKER).count(), 1);
        assert_eq!(
            text.chars().count(),
            8 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn test_cap_counts_characters() {
        let mut buf = OutputBuffer::new(3);
        assert!(!buf.push("ééé!"));
        assert!(buf.reset(3).starts_with("ééé"));
    }

    #[test]
    fn test_reset_returns_text_and_clears() {
        let mut buf = OutputBuffer::new(2);
        buf.push("xyz");
        let taken = buf.reset(5);
        assert!(taken.starts_with("xy"));
        assert_eq!(buf.text, "");
        assert!(!buf.truncated);
        assert!(buf.push("12345"));
    }
}
