//! Byte-accurate tail-read primitives.
//!
//! All file positions here are byte offsets. Recording payloads are UTF-8 and
//! a read may end mid-character, so nothing in this module counts characters;
//! complete lines are only carved out at `\n` boundaries and decoded after.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::SystemTime;

/// Snapshot of the stat fields the tail loop compares between change
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

pub fn stat_file(path: &Path) -> std::io::Result<FileStat> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStat {
        size: meta.len(),
        mtime: meta.modified().ok(),
    })
}

/// Read up to `len` bytes starting at byte `offset`. Short reads (a writer
/// racing us, or a stat that ran ahead of the data) return what was read.
pub fn read_span(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Residual buffer for an append-only line stream. Holds the trailing partial
/// line between reads; the residual never contains a newline byte.
#[derive(Debug, Default)]
pub struct LineBuffer {
    residual: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and return the complete lines they finish,
    /// oldest first. Trailing `\r` is stripped alongside the `\n`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.residual.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.residual.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.residual.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(text) => lines.push(text),
                Err(err) => {
                    tracing::debug!(%err, "recording line is not valid utf-8, decoding lossily");
                    lines.push(String::from_utf8_lossy(err.as_bytes()).into_owned());
                }
            }
        }
        lines
    }

    pub fn len(&self) -> usize {
        self.residual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residual.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn splits_complete_lines_and_keeps_the_partial_tail() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"one\ntwo\nthr");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(buf.len(), 3);

        let lines = buf.push(b"ee\n");
        assert_eq!(lines, vec!["three".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn multibyte_character_split_across_pushes_survives() {
        let text = "caf\u{e9} \u{1f680}\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte é.
        let cut = 4;
        let mut buf = LineBuffer::new();
        assert!(buf.push(&bytes[..cut]).is_empty());
        let lines = buf.push(&bytes[cut..]);
        assert_eq!(lines, vec!["caf\u{e9} \u{1f680}".to_string()]);
    }

    #[test]
    fn residual_never_holds_a_newline() {
        let mut buf = LineBuffer::new();
        buf.push(b"a\nb\nc");
        assert_eq!(buf.len(), 1);
        buf.push(b"\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn crlf_endings_are_trimmed() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"line\r\n");
        assert_eq!(lines, vec!["line".to_string()]);
    }

    #[test]
    fn read_span_is_positional_and_byte_exact() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all("héllo wörld".as_bytes()).unwrap();
        file.flush().unwrap();

        // "héllo " is 7 bytes; read the rest from there.
        let bytes = read_span(file.path(), 7, 6).unwrap();
        assert_eq!(bytes, "wörld".as_bytes());
    }

    #[test]
    fn read_span_tolerates_a_stat_that_ran_ahead() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        let bytes = read_span(file.path(), 1, 100).unwrap();
        assert_eq!(bytes, b"bc");
    }

    #[test]
    fn stat_reports_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"12345").unwrap();
        file.flush().unwrap();
        let stat = stat_file(file.path()).unwrap();
        assert_eq!(stat.size, 5);
    }
}
