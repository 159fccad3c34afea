//! Process output buffering.
//!
//! Sandbox processes stream text in arbitrary chunks. [`OutputBuffer`] turns
//! that stream into whole lines for the terminal log: chunks are joined,
//! split on `\n`, stripped of ANSI escape sequences and surrounding whitespace,
//! and empty lines are dropped. The trailing fragment of a chunk is held back
//! until its newline arrives or the stream ends.

use std::borrow::Cow;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    partial: String,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the lines it completed.
    pub fn append(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);

        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete.split('\n').filter_map(clean_line).collect()
    }

    /// Emit whatever partial line remains. Called once the stream ends.
    pub fn flush(&mut self) -> Vec<String> {
        let partial = std::mem::take(&mut self.partial);
        clean_line(&partial).into_iter().collect()
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> &str {
        &self.partial
    }
}

fn clean_line(raw: &str) -> Option<String> {
    let stripped: Cow<'_, str> = console::strip_ansi_codes(raw);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut buffer = OutputBuffer::new();
        let mut lines = Vec::new();
        lines.extend(buffer.append("hello "));
        lines.extend(buffer.append("world\nfoo"));
        lines.extend(buffer.append("bar\n"));
        lines.extend(buffer.flush());
        assert_eq!(lines, vec!["hello world", "foobar"]);
    }

    #[test]
    fn chunk_without_newline_is_held_back() {
        let mut buffer = OutputBuffer::new();
        assert!(buffer.append("partial").is_empty());
        assert_eq!(buffer.pending(), "partial");
        assert_eq!(buffer.flush(), vec!["partial"]);
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn strips_ansi_codes() {
        let mut buffer = OutputBuffer::new();
        let lines = buffer.append("\u{1b}[32m  VITE v5.0.0\u{1b}[0m  ready in 300 ms\n");
        assert_eq!(lines, vec!["VITE v5.0.0  ready in 300 ms"]);
    }

    #[test]
    fn drops_blank_and_ansi_only_lines() {
        let mut buffer = OutputBuffer::new();
        let lines = buffer.append("one\n\n   \n\u{1b}[2K\ntwo\r\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn several_lines_in_one_chunk() {
        let mut buffer = OutputBuffer::new();
        let lines = buffer.append("a\nb\nc");
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(buffer.flush(), vec!["c"]);
    }

    #[test]
    fn flush_of_whitespace_is_empty() {
        let mut buffer = OutputBuffer::new();
        buffer.append("done\n   ");
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn preserves_every_visible_character_in_order() {
        let input = "added 12 packages\nfound 0 vulnerabilities\nnpm notice";
        let mut buffer = OutputBuffer::new();
        let mut lines = Vec::new();
        for chunk in input.as_bytes().chunks(5) {
            lines.extend(buffer.append(std::str::from_utf8(chunk).unwrap()));
        }
        lines.extend(buffer.flush());
        assert_eq!(lines.join("\n"), input);
    }
}
