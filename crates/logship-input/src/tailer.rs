use logship_core::config::StartPosition;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Consecutive EOF polls tolerated before an inode change or disappearance
/// is acted on. At the default 500 ms cadence this is roughly ten seconds,
/// enough for an in-flight rotation to settle.
const ROTATE_GRACE_POLLS: u32 = 20;

/// One physical line together with the byte offset just past its newline.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub text: String,
    pub end_offset: u64,
}

/// What an EOF poll concluded about the watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStatus {
    Idle,
    Truncated,
    Rotated,
    Gone,
}

/// Byte-accurate file tailer.
///
/// A file's identity is its inode; the committed offset is only valid
/// against the inode it was recorded for. The tailer reads whole lines
/// from the uncommitted read position and leaves committing to the caller,
/// which signals when a complete logical event has been shipped.
pub struct Tailer {
    path: PathBuf,
    pos_path: PathBuf,
    save_position: bool,
    start_position: StartPosition,
    reader: Option<BufReader<File>>,
    pos_file: Option<File>,
    inode: u64,
    committed: u64,
    read_offset: u64,
    eof_polls: u32,
    line_buffer: String,
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
    0
}

/// Position file path for a tailed path: `<libdir>/logship-<basename>.pos`.
fn position_path(libdir: &Path, path: &Path) -> PathBuf {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    libdir.join(format!("logship-{}.pos", basename))
}

fn parse_position(content: &str) -> Option<(u64, u64)> {
    let (inode, offset) = content.trim().split_once(':')?;
    Some((inode.parse().ok()?, offset.parse().ok()?))
}

impl Tailer {
    pub fn new(
        path: impl Into<PathBuf>,
        libdir: impl AsRef<Path>,
        start_position: StartPosition,
        save_position: bool,
    ) -> Self {
        let path = path.into();
        let pos_path = position_path(libdir.as_ref(), &path);
        Self {
            path,
            pos_path,
            save_position,
            start_position,
            reader: None,
            pos_file: None,
            inode: 0,
            committed: 0,
            read_offset: 0,
            eof_polls: 0,
            line_buffer: String::with_capacity(1024),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// The committed byte offset.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// The read position: everything before it has been handed out.
    pub fn tell(&self) -> u64 {
        self.read_offset
    }

    /// Open the file and seek to the resume position: the saved offset when
    /// the saved inode still matches, otherwise `start_position`.
    pub fn open(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        let inode = inode_of(&metadata);
        let size = metadata.len();

        let saved = if self.save_position {
            self.read_position_file()
        } else {
            None
        };

        let offset = match saved {
            Some((saved_inode, saved_offset)) if saved_inode == inode && saved_offset <= size => {
                debug!(path = %self.path.display(), offset = saved_offset, "Resuming from saved position");
                saved_offset
            }
            _ => match self.start_position {
                StartPosition::Begin => 0,
                StartPosition::End => size,
            },
        };

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;

        info!(path = %self.path.display(), inode, offset, "Tailing file");
        self.reader = Some(reader);
        self.inode = inode;
        self.committed = offset;
        self.read_offset = offset;
        self.eof_polls = 0;
        Ok(())
    }

    /// Read up to `max` complete lines from the read position. A trailing
    /// line without its newline is left for the next poll so offsets always
    /// fall on line boundaries.
    pub fn read_lines(&mut self, max: usize) -> io::Result<Vec<RawLine>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };

        let mut lines = Vec::new();
        while lines.len() < max {
            self.line_buffer.clear();
            let bytes_read = reader.read_line(&mut self.line_buffer)?;
            if bytes_read == 0 {
                break;
            }
            if !self.line_buffer.ends_with('\n') {
                // Partial write in progress; rewind and retry next poll.
                reader.seek(SeekFrom::Start(self.read_offset))?;
                break;
            }
            self.read_offset += bytes_read as u64;
            let text = self
                .line_buffer
                .trim_end_matches('\n')
                .trim_end_matches('\r')
                .to_string();
            lines.push(RawLine {
                text,
                end_offset: self.read_offset,
            });
        }

        if !lines.is_empty() {
            self.eof_polls = 0;
        }
        Ok(lines)
    }

    /// Called when a poll produced no lines. Checks the path for
    /// truncation, rotation, and disappearance; rotation and disappearance
    /// are only acted on after the grace window so an in-flight rotation is
    /// not cut short.
    pub fn poll_eof(&mut self) -> io::Result<TailStatus> {
        if self.reader.is_none() {
            return Ok(TailStatus::Idle);
        }
        self.eof_polls = self.eof_polls.saturating_add(1);

        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.eof_polls > ROTATE_GRACE_POLLS {
                    warn!(path = %self.path.display(), "Watched path is gone, closing");
                    self.reader = None;
                    return Ok(TailStatus::Gone);
                }
                return Ok(TailStatus::Idle);
            }
            Err(e) => return Err(e),
        };

        if inode_of(&metadata) == self.inode {
            if metadata.len() < self.committed {
                info!(path = %self.path.display(), "File truncated, restarting at 0");
                self.reopen_at_start()?;
                return Ok(TailStatus::Truncated);
            }
            return Ok(TailStatus::Idle);
        }

        if self.eof_polls > ROTATE_GRACE_POLLS {
            info!(path = %self.path.display(), "File rotated, reopening");
            self.reopen_at_start()?;
            return Ok(TailStatus::Rotated);
        }
        Ok(TailStatus::Idle)
    }

    fn reopen_at_start(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        self.inode = inode_of(&metadata);
        self.reader = Some(BufReader::new(file));
        self.committed = 0;
        self.read_offset = 0;
        self.eof_polls = 0;
        self.write_position_file()?;
        Ok(())
    }

    /// Advance the committed offset to the end of a shipped logical event
    /// and persist it.
    pub fn commit(&mut self, offset: u64) -> io::Result<()> {
        self.committed = offset;
        self.write_position_file()
    }

    fn read_position_file(&self) -> Option<(u64, u64)> {
        let mut content = String::new();
        File::open(&self.pos_path)
            .ok()?
            .read_to_string(&mut content)
            .ok()?;
        parse_position(&content)
    }

    /// The position record is rewritten in place on every commit. The
    /// fixed-width fields keep each rewrite the same length, so a crashed
    /// write never leaves a shorter, ambiguous record behind.
    fn write_position_file(&mut self) -> io::Result<()> {
        if !self.save_position {
            return Ok(());
        }
        if self.pos_file.is_none() {
            if let Some(parent) = self.pos_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.pos_file = Some(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&self.pos_path)?,
            );
        }
        let pos_file = self.pos_file.as_mut().expect("position file open");
        pos_file.seek(SeekFrom::Start(0))?;
        pos_file.write_all(format!("{:014}:{:014}", self.inode, self.committed).as_bytes())?;
        pos_file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        path
    }

    fn texts(lines: &[RawLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_read_lines_and_offsets() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "L1\nL2\nL3\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, false);
        tailer.open().unwrap();

        let lines = tailer.read_lines(100).unwrap();
        assert_eq!(texts(&lines), ["L1", "L2", "L3"]);
        assert_eq!(lines[0].end_offset, 3);
        assert_eq!(lines[2].end_offset, 9);
        assert_eq!(tailer.tell(), 9);
    }

    #[test]
    fn test_partial_line_left_for_next_poll() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "complete\npart");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, false);
        tailer.open().unwrap();

        let lines = tailer.read_lines(100).unwrap();
        assert_eq!(texts(&lines), ["complete"]);
        assert_eq!(tailer.tell(), 9);

        // The writer finishes the line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"ial\n").unwrap();
        file.flush().unwrap();

        let lines = tailer.read_lines(100).unwrap();
        assert_eq!(texts(&lines), ["partial"]);
    }

    #[test]
    fn test_start_position_end() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "old1\nold2\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::End, false);
        tailer.open().unwrap();
        assert!(tailer.read_lines(100).unwrap().is_empty());

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"new\n").unwrap();
        file.flush().unwrap();

        assert_eq!(texts(&tailer.read_lines(100).unwrap()), ["new"]);
    }

    #[test]
    fn test_position_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "L1\nL2\nL3\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, true);
        tailer.open().unwrap();
        let lines = tailer.read_lines(100).unwrap();
        tailer.commit(lines.last().unwrap().end_offset).unwrap();

        let pos_path = position_path(dir.path(), &path);
        let content = std::fs::read_to_string(&pos_path).unwrap();
        assert_eq!(content.len(), 29);
        let (_, offset) = parse_position(&content).unwrap();
        assert_eq!(offset, 9);

        // A fresh tailer resumes at the committed offset and re-reads
        // nothing.
        let mut resumed = Tailer::new(&path, dir.path(), StartPosition::Begin, true);
        resumed.open().unwrap();
        assert_eq!(resumed.committed(), 9);
        assert!(resumed.read_lines(100).unwrap().is_empty());
    }

    #[test]
    fn test_position_ignored_after_inode_change() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "L1\nL2\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, true);
        tailer.open().unwrap();
        let lines = tailer.read_lines(100).unwrap();
        tailer.commit(lines.last().unwrap().end_offset).unwrap();
        drop(tailer);

        // Replace the file: new inode, same path.
        std::fs::remove_file(&path).unwrap();
        write_file(&dir, "app.log", "fresh1\nfresh2\n");

        let mut resumed = Tailer::new(&path, dir.path(), StartPosition::Begin, true);
        resumed.open().unwrap();
        assert_eq!(resumed.committed(), 0);
        assert_eq!(
            texts(&resumed.read_lines(100).unwrap()),
            ["fresh1", "fresh2"]
        );
    }

    #[test]
    fn test_truncation_resets_offset() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "L1\nL2\nL3\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, false);
        tailer.open().unwrap();
        let lines = tailer.read_lines(100).unwrap();
        tailer.commit(lines.last().unwrap().end_offset).unwrap();

        // Truncate below the committed offset.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(0).unwrap();
        drop(file);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"after\n").unwrap();
        file.flush().unwrap();

        assert!(tailer.read_lines(100).unwrap().is_empty());
        assert_eq!(tailer.poll_eof().unwrap(), TailStatus::Truncated);
        assert_eq!(texts(&tailer.read_lines(100).unwrap()), ["after"]);
    }

    #[test]
    fn test_rotation_waits_for_grace() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "old\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, false);
        tailer.open().unwrap();
        assert_eq!(texts(&tailer.read_lines(100).unwrap()), ["old"]);

        // Rotate: rename away, create a successor.
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        write_file(&dir, "app.log", "rotated\n");

        // Within the grace window the old handle is kept.
        for _ in 0..ROTATE_GRACE_POLLS {
            assert!(tailer.read_lines(100).unwrap().is_empty());
            assert_eq!(tailer.poll_eof().unwrap(), TailStatus::Idle);
        }
        assert!(tailer.read_lines(100).unwrap().is_empty());
        assert_eq!(tailer.poll_eof().unwrap(), TailStatus::Rotated);
        assert_eq!(tailer.committed(), 0);
        assert_eq!(texts(&tailer.read_lines(100).unwrap()), ["rotated"]);
    }

    #[test]
    fn test_gone_after_grace() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "app.log", "only\n");

        let mut tailer = Tailer::new(&path, dir.path(), StartPosition::Begin, false);
        tailer.open().unwrap();
        assert_eq!(texts(&tailer.read_lines(100).unwrap()), ["only"]);

        std::fs::remove_file(&path).unwrap();
        for _ in 0..ROTATE_GRACE_POLLS {
            assert_eq!(tailer.poll_eof().unwrap(), TailStatus::Idle);
        }
        assert_eq!(tailer.poll_eof().unwrap(), TailStatus::Gone);
        assert!(!tailer.is_open());
    }
}
