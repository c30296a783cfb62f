use async_trait::async_trait;
use logship_core::config::FileOutputConfig;
use logship_core::{Event, Output, OutputError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

/// Append-mode JSON-lines writer. The path is re-opened when its inode
/// changes underneath us, so external log rotation keeps working.
pub struct FileOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    inode: u64,
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

impl FileOutput {
    pub fn new(config: &FileOutputConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            writer: None,
            inode: 0,
        }
    }

    fn open(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.inode = inode_of(&file.metadata()?);
        self.writer = Some(BufWriter::new(file));
        info!(path = %self.path.display(), "Opened output file");
        Ok(())
    }

    fn rotated(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => inode_of(&metadata) != self.inode,
            Err(_) => true,
        }
    }
}

#[async_trait]
impl Output for FileOutput {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn push(&mut self, events: &[Event]) -> Result<(), OutputError> {
        if self.writer.is_none() || self.rotated() {
            self.open().map_err(|e| OutputError::Write(e.to_string()))?;
        }
        let writer = self.writer.as_mut().expect("writer open");
        for event in events {
            let json = event
                .to_json()
                .map_err(|e| OutputError::Serialization(e.to_string()))?;
            writer
                .write_all(json.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .map_err(|e| OutputError::Write(e.to_string()))?;
        }
        writer.flush().map_err(|e| OutputError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::config::{CommonOutputConfig, OneOrMany};
    use tempfile::TempDir;

    fn config(path: &std::path::Path) -> FileOutputConfig {
        FileOutputConfig {
            common: CommonOutputConfig {
                types: OneOrMany::One("*".to_string()),
            },
            path: path.to_string_lossy().to_string(),
        }
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut output = FileOutput::new(&config(&path));

        let events: Vec<Event> = (1..=2)
            .map(|i| Event::from_line("h", "/f", format!("L{}", i)))
            .collect();
        output.push(&events).await.unwrap();
        output.push(&events[..1]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().all(|l| l.contains("\"line\"")));
    }

    #[tokio::test]
    async fn test_reopens_after_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut output = FileOutput::new(&config(&path));

        let event = Event::from_line("h", "/f", "one".to_string());
        output.push(std::slice::from_ref(&event)).await.unwrap();

        // Rotate the output file away.
        std::fs::rename(&path, dir.path().join("out.jsonl.1")).unwrap();
        output.push(std::slice::from_ref(&event)).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
