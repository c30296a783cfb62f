use crate::multiline::MultilineGrouper;
use crate::oracle_xml::{OraRecord, OracleXmlGrouper};
use crate::tailer::{TailStatus, Tailer};
use async_trait::async_trait;
use logship_core::config::{FileInputConfig, MultilineMode, StartPosition};
use logship_core::{Event, Input, InputError};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum EventGrouper {
    Lines(MultilineGrouper),
    OracleXml(OracleXmlGrouper),
}

/// A complete logical event coming out of a grouper, before enrichment.
struct Grouped {
    text: String,
    attrs: Vec<(String, String)>,
    end_offset: u64,
}

impl From<OraRecord> for Grouped {
    fn from(record: OraRecord) -> Self {
        Self {
            text: record.text,
            attrs: record.attrs,
            end_offset: record.end_offset,
        }
    }
}

/// File tail input: tailer, line filters, and multi-line grouping behind
/// the pull contract. One instance owns one concrete file.
pub struct FileInput {
    tailer: Tailer,
    grouper: EventGrouper,
    skip: Vec<Regex>,
    grep: Vec<Regex>,
    host: String,
    path_str: String,
    gone: bool,
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    // Validated at config load.
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

impl FileInput {
    /// Build an input for one concrete path. The watcher passes
    /// `start_position = Begin` for rotated-in successors so nothing at the
    /// head of a new file is skipped.
    pub fn new(
        config: &FileInputConfig,
        path: PathBuf,
        libdir: &Path,
        start_position: StartPosition,
    ) -> Self {
        let grouper = match config.multiline_mode {
            MultilineMode::OracleXml => EventGrouper::OracleXml(OracleXmlGrouper::new()),
            _ => EventGrouper::Lines(MultilineGrouper::from_config(config)),
        };
        let path_str = path.to_string_lossy().to_string();
        Self {
            tailer: Tailer::new(path, libdir, start_position, config.save_position),
            grouper,
            skip: compile_all(config.skip.as_slice()),
            grep: compile_all(config.grep.as_slice()),
            host: logship_core::local_hostname(),
            path_str,
            gone: false,
        }
    }

    pub fn path(&self) -> &Path {
        self.tailer.path()
    }

    fn drop_line(&self, text: &str) -> bool {
        if self.skip.iter().any(|re| re.is_match(text)) {
            return true;
        }
        !self.grep.is_empty() && !self.grep.iter().any(|re| re.is_match(text))
    }

    fn feed(&mut self, text: &str, end_offset: u64) -> Vec<Grouped> {
        match &mut self.grouper {
            EventGrouper::Lines(grouper) => grouper
                .push_line(text, end_offset)
                .into_iter()
                .map(|g| Grouped {
                    text: g.text,
                    attrs: Vec::new(),
                    end_offset: g.end_offset,
                })
                .collect(),
            EventGrouper::OracleXml(grouper) => grouper
                .push_line(text, end_offset)
                .into_iter()
                .map(Grouped::from)
                .collect(),
        }
    }

    fn idle_flush(&mut self) -> Vec<Grouped> {
        match &mut self.grouper {
            EventGrouper::Lines(grouper) => grouper
                .idle_flush()
                .into_iter()
                .map(|g| Grouped {
                    text: g.text,
                    attrs: Vec::new(),
                    end_offset: g.end_offset,
                })
                .collect(),
            EventGrouper::OracleXml(grouper) => {
                grouper.idle_flush().into_iter().map(Grouped::from).collect()
            }
        }
    }

    fn flush_all(&mut self) -> Vec<Grouped> {
        match &mut self.grouper {
            EventGrouper::Lines(grouper) => grouper
                .flush()
                .into_iter()
                .map(|g| Grouped {
                    text: g.text,
                    attrs: Vec::new(),
                    end_offset: g.end_offset,
                })
                .collect(),
            EventGrouper::OracleXml(grouper) => {
                grouper.flush().into_iter().map(Grouped::from).collect()
            }
        }
    }

    fn build_event(&self, grouped: Grouped) -> Event {
        let mut event = Event::from_line(&self.host, &self.path_str, grouped.text);
        for (key, value) in grouped.attrs {
            event.set_field(format!("ora.{}", key), value);
        }
        event
    }

    fn read_error(&self, e: std::io::Error) -> InputError {
        InputError::Read {
            path: self.path_str.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Input for FileInput {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn pull(&mut self, max_events: usize) -> Result<Vec<Event>, InputError> {
        if self.gone {
            return Err(InputError::Gone(self.path_str.clone()));
        }
        if !self.tailer.is_open() {
            match self.tailer.open() {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Not created yet; keep polling.
                    return Ok(Vec::new());
                }
                Err(e) => return Err(self.read_error(e)),
            }
        }

        let lines = self
            .tailer
            .read_lines(max_events)
            .map_err(|e| self.read_error(e))?;

        if lines.is_empty() {
            match self.tailer.poll_eof().map_err(|e| self.read_error(e))? {
                TailStatus::Gone => {
                    // Hand out whatever the grouper still holds, then
                    // report the removal on the next pull.
                    let flushed = self.flush_all();
                    if flushed.is_empty() {
                        return Err(InputError::Gone(self.path_str.clone()));
                    }
                    warn!(
                        path = %self.path_str,
                        events = flushed.len(),
                        "Flushing buffer of removed file"
                    );
                    self.gone = true;
                    return Ok(flushed.into_iter().map(|g| self.build_event(g)).collect());
                }
                TailStatus::Rotated | TailStatus::Truncated => {
                    // The buffered tail of the old data cannot continue;
                    // emit it as-is. Offsets now belong to the new data, so
                    // nothing is committed for these.
                    let flushed = self.flush_all();
                    return Ok(flushed.into_iter().map(|g| self.build_event(g)).collect());
                }
                TailStatus::Idle => {}
            }

            let flushed = self.idle_flush();
            if flushed.is_empty() {
                return Ok(Vec::new());
            }
            debug!(path = %self.path_str, "Idle flush");
            let events = flushed.into_iter().map(|g| self.build_event(g)).collect();
            self.tailer
                .commit(self.tailer.tell())
                .map_err(|e| self.read_error(e))?;
            return Ok(events);
        }

        let mut events = Vec::new();
        let mut commit_to = None;
        for line in lines {
            if self.drop_line(&line.text) {
                continue;
            }
            for grouped in self.feed(&line.text, line.end_offset) {
                commit_to = Some(commit_to.unwrap_or(0u64).max(grouped.end_offset));
                events.push(self.build_event(grouped));
            }
        }

        // One commit per pull, covering every complete event emitted.
        // Partial buffers never advance the committed offset.
        if let Some(offset) = commit_to {
            self.tailer.commit(offset).map_err(|e| self.read_error(e))?;
        }
        Ok(events)
    }
}
