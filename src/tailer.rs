//! Follow a growing log file, across truncation and rotation.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Identity of an open file, used to notice rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    reader: BufReader<File>,
    id: FileId,
    position: u64,
}

impl OpenFile {
    fn open(path: &Path, at_end: bool) -> io::Result<Self> {
        let file = File::open(path)?;
        let id = FileId::of(&file.metadata()?);
        let mut reader = BufReader::new(file);
        let position = if at_end {
            reader.seek(SeekFrom::End(0))?
        } else {
            0
        };
        Ok(Self {
            reader,
            id,
            position,
        })
    }

    /// Read complete lines from the current position.
    ///
    /// A trailing partial line is left for the next read. Bytes which are
    /// not valid UTF-8 are replaced rather than failing the read.
    fn read_lines(&mut self, lines: &mut Vec<String>) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if !buf.ends_with(b"\n") {
                self.reader.seek(SeekFrom::Start(self.position))?;
                break;
            }
            self.position += n as u64;
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(&['\r', '\n'][..]).to_string());
        }
        Ok(())
    }
}

/// Returns lines appended to a file since the last call.
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    file: Option<OpenFile>,
    polled: bool,
}

impl Tailer {
    /// Start following `path`. Existing content is skipped.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            polled: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read new complete lines.
    ///
    /// Returns `Ok(None)` while the file does not exist. A file appearing
    /// after the first call is read from the start.
    pub fn tail(&mut self) -> io::Result<Option<Vec<String>>> {
        let first = !self.polled;
        self.polled = true;
        let current = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.file.is_none() {
                    return Ok(None);
                }
                // rotated away and not yet recreated; drain what we have
                let mut lines = Vec::new();
                if let Some(file) = self.file.as_mut() {
                    file.read_lines(&mut lines)?;
                }
                return Ok(Some(lines));
            }
            Err(e) => return Err(e),
        };

        let mut lines = Vec::new();
        match self.file.as_mut() {
            None => {
                let mut file = OpenFile::open(&self.path, first)?;
                file.read_lines(&mut lines)?;
                self.file = Some(file);
            }
            Some(file) if file.id != FileId::of(&current) => {
                tracing::info!("{} was replaced, reopening", self.path.display());
                file.read_lines(&mut lines)?;
                let mut file = OpenFile::open(&self.path, false)?;
                file.read_lines(&mut lines)?;
                self.file = Some(file);
            }
            Some(file) if current.len() < file.position => {
                tracing::info!("{} was truncated, reading from start", self.path.display());
                file.reader.seek(SeekFrom::Start(0))?;
                file.position = 0;
                file.read_lines(&mut lines)?;
            }
            Some(file) => file.read_lines(&mut lines)?,
        }
        Ok(Some(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut tailer = Tailer::new(dir.path().join("nothing.log"));
        assert_eq!(tailer.tail().unwrap(), None);
        assert_eq!(tailer.path(), dir.path().join("nothing.log"));
    }

    #[test]
    fn test_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.log");
        append(&path, "old line\n");

        let mut tailer = Tailer::new(&path);
        assert_eq!(tailer.tail().unwrap(), Some(vec![]));
        append(&path, "first\nsecond\n");
        assert_eq!(
            tailer.tail().unwrap(),
            Some(vec!["first".to_string(), "second".to_string()])
        );
        assert_eq!(tailer.tail().unwrap(), Some(vec![]));
    }

    #[test]
    fn test_partial_lines_wait() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peerstats");
        append(&path, "");

        let mut tailer = Tailer::new(&path);
        tailer.tail().unwrap();
        append(&path, "complete\npart");
        assert_eq!(tailer.tail().unwrap(), Some(vec!["complete".to_string()]));
        append(&path, "ial\n");
        assert_eq!(tailer.tail().unwrap(), Some(vec!["partial".to_string()]));
    }

    #[test]
    fn test_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.log");
        append(&path, "");

        let mut tailer = Tailer::new(&path);
        tailer.tail().unwrap();
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"bad \xff\xfe line\nnext\npart").unwrap();
        assert_eq!(
            tailer.tail().unwrap(),
            Some(vec!["bad \u{fffd}\u{fffd} line".to_string(), "next".to_string()])
        );
        append(&path, "ial\n");
        assert_eq!(tailer.tail().unwrap(), Some(vec!["partial".to_string()]));
        assert_eq!(tailer.tail().unwrap(), Some(vec![]));
    }

    #[test]
    fn test_file_created_later() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.log");

        let mut tailer = Tailer::new(&path);
        assert_eq!(tailer.tail().unwrap(), None);
        append(&path, "first\n");
        assert_eq!(tailer.tail().unwrap(), Some(vec!["first".to_string()]));
    }

    #[test]
    fn test_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peerstats");
        append(&path, "");

        let mut tailer = Tailer::new(&path);
        tailer.tail().unwrap();
        append(&path, "one long line of text\n");
        assert_eq!(tailer.tail().unwrap().unwrap().len(), 1);

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(tailer.tail().unwrap(), Some(vec!["new".to_string()]));
    }

    #[test]
    fn test_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.log");
        let rotated = dir.path().join("measurements.log.1");
        append(&path, "");

        let mut tailer = Tailer::new(&path);
        tailer.tail().unwrap();
        append(&path, "before\n");
        std::fs::rename(&path, &rotated).unwrap();
        append(&rotated, "late\n");

        // old file is drained while the new one is missing
        assert_eq!(
            tailer.tail().unwrap(),
            Some(vec!["before".to_string(), "late".to_string()])
        );

        append(&path, "after\n");
        assert_eq!(tailer.tail().unwrap(), Some(vec!["after".to_string()]));
    }
}
