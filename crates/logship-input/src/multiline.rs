use logship_core::config::{FileInputConfig, MultilineMode};
use regex::Regex;
use std::time::{Duration, Instant};

/// Time a non-empty buffer may sit without new input before it is flushed
/// as-is.
pub const IDLE_FLUSH: Duration = Duration::from_secs(10);

/// A complete logical event assembled from one or more physical lines.
/// `end_offset` is the byte position just past the last line that belongs
/// to the event; committing it makes the event durable across restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedLine {
    pub text: String,
    pub end_offset: u64,
}

/// State machine that coalesces raw lines into logical events.
///
/// `single-line` passes lines through. The other modes buffer an open event
/// and close it when the configured boundary is seen; lines outside any
/// event are dropped or emitted as singletons depending on `drop_garbage`.
pub struct MultilineGrouper {
    mode: MultilineMode,
    prefix: Option<Regex>,
    suffix: Option<Regex>,
    garbage: Option<Regex>,
    indented_group: Option<Regex>,
    drop_garbage: bool,
    buffer: Vec<String>,
    buffer_end: u64,
    open: bool,
    last_activity: Instant,
    idle_timeout: Duration,
}

fn compile(pattern: &Option<String>) -> Option<Regex> {
    // Patterns were validated at config load.
    pattern.as_ref().and_then(|p| Regex::new(p).ok())
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

impl MultilineGrouper {
    pub fn from_config(config: &FileInputConfig) -> Self {
        Self {
            mode: config.multiline_mode,
            prefix: compile(&config.multiline_prefix),
            suffix: compile(&config.multiline_suffix),
            garbage: compile(&config.multiline_garbage),
            indented_group: compile(&config.multiline_indented_group),
            drop_garbage: config.multiline_drop_garbage,
            buffer: Vec::new(),
            buffer_end: 0,
            open: false,
            last_activity: Instant::now(),
            idle_timeout: IDLE_FLUSH,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn matches(re: &Option<Regex>, line: &str) -> bool {
        re.as_ref().is_some_and(|re| re.is_match(line))
    }

    fn take_buffer(&mut self) -> Option<GroupedLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = self.buffer.join("\n");
        self.buffer.clear();
        self.open = false;
        Some(GroupedLine {
            text,
            end_offset: self.buffer_end,
        })
    }

    fn buffer_line(&mut self, line: &str, end_offset: u64) {
        self.buffer.push(line.to_string());
        self.buffer_end = end_offset;
    }

    fn garbage_line(&self, line: &str, end_offset: u64, out: &mut Vec<GroupedLine>) {
        if !self.drop_garbage {
            out.push(GroupedLine {
                text: line.to_string(),
                end_offset,
            });
        }
    }

    /// Feed one physical line. Returns every event the line completed, in
    /// order; a line can close the open event and emit itself.
    pub fn push_line(&mut self, line: &str, end_offset: u64) -> Vec<GroupedLine> {
        self.last_activity = Instant::now();
        let mut out = Vec::new();

        match self.mode {
            MultilineMode::SingleLine | MultilineMode::OracleXml => {
                out.push(GroupedLine {
                    text: line.to_string(),
                    end_offset,
                });
            }
            MultilineMode::Indented => {
                if is_indented(line) {
                    self.buffer_line(line, end_offset);
                } else {
                    out.extend(self.take_buffer());
                    self.buffer_line(line, end_offset);
                }
            }
            MultilineMode::IndentedGroup => {
                if self.open {
                    if is_indented(line) || Self::matches(&self.indented_group, line) {
                        self.buffer_line(line, end_offset);
                    } else if Self::matches(&self.prefix, line) {
                        out.extend(self.take_buffer());
                        self.open = true;
                        self.buffer_line(line, end_offset);
                    } else {
                        out.extend(self.take_buffer());
                        self.garbage_line(line, end_offset, &mut out);
                    }
                } else if Self::matches(&self.prefix, line) {
                    self.open = true;
                    self.buffer_line(line, end_offset);
                } else {
                    self.garbage_line(line, end_offset, &mut out);
                }
            }
            MultilineMode::PrefixGarbage => {
                if self.open {
                    if Self::matches(&self.prefix, line) {
                        out.extend(self.take_buffer());
                        self.open = true;
                        self.buffer_line(line, end_offset);
                    } else if Self::matches(&self.garbage, line) {
                        out.extend(self.take_buffer());
                        self.garbage_line(line, end_offset, &mut out);
                    } else {
                        self.buffer_line(line, end_offset);
                    }
                } else if Self::matches(&self.prefix, line) {
                    self.open = true;
                    self.buffer_line(line, end_offset);
                } else {
                    self.garbage_line(line, end_offset, &mut out);
                }
            }
            MultilineMode::PrefixSuffix => {
                if self.open {
                    self.buffer_line(line, end_offset);
                    if Self::matches(&self.suffix, line) {
                        out.extend(self.take_buffer());
                    }
                } else if Self::matches(&self.prefix, line) {
                    self.open = true;
                    self.buffer_line(line, end_offset);
                    if Self::matches(&self.suffix, line) {
                        out.extend(self.take_buffer());
                    }
                } else {
                    self.garbage_line(line, end_offset, &mut out);
                }
            }
        }

        out
    }

    /// Emit the buffer as-is when no line arrived for the idle timeout.
    pub fn idle_flush(&mut self) -> Option<GroupedLine> {
        if self.buffer.is_empty() || self.last_activity.elapsed() < self.idle_timeout {
            return None;
        }
        self.flush()
    }

    /// Unconditionally emit whatever is buffered and reset state.
    pub fn flush(&mut self) -> Option<GroupedLine> {
        self.last_activity = Instant::now();
        self.take_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::config::{CommonInputConfig, OneOrMany, StartPosition};

    fn config(mode: MultilineMode) -> FileInputConfig {
        FileInputConfig {
            common: CommonInputConfig::default(),
            path: OneOrMany::One("/f".to_string()),
            start_position: StartPosition::Begin,
            save_position: false,
            skip: OneOrMany::default(),
            grep: OneOrMany::default(),
            multiline_mode: mode,
            multiline_prefix: None,
            multiline_suffix: None,
            multiline_garbage: None,
            multiline_indented_group: None,
            multiline_drop_garbage: true,
        }
    }

    fn feed(grouper: &mut MultilineGrouper, lines: &[&str]) -> Vec<String> {
        let mut offset = 0u64;
        let mut events = Vec::new();
        for line in lines {
            offset += line.len() as u64 + 1;
            for grouped in grouper.push_line(line, offset) {
                events.push(grouped.text);
            }
        }
        events
    }

    #[test]
    fn test_single_line_mode() {
        let mut grouper = MultilineGrouper::from_config(&config(MultilineMode::SingleLine));
        let events = feed(&mut grouper, &["L1", "L2", "L3"]);
        assert_eq!(events, vec!["L1", "L2", "L3"]);
        assert!(grouper.is_empty());
    }

    #[test]
    fn test_indented_mode() {
        let mut grouper = MultilineGrouper::from_config(&config(MultilineMode::Indented));
        let events = feed(
            &mut grouper,
            &[
                "Exception in thread main",
                "    at com.example.Foo",
                "    at com.example.Bar",
                "Next message",
            ],
        );
        assert_eq!(
            events,
            vec!["Exception in thread main\n    at com.example.Foo\n    at com.example.Bar"]
        );
        // The next message stays buffered until something closes it.
        assert_eq!(grouper.flush().unwrap().text, "Next message");
    }

    #[test]
    fn test_indented_group_mode() {
        let mut cfg = config(MultilineMode::IndentedGroup);
        cfg.multiline_prefix = Some("^ERROR".to_string());
        cfg.multiline_indented_group = Some("^Caused by".to_string());
        cfg.multiline_drop_garbage = true;

        let mut grouper = MultilineGrouper::from_config(&cfg);
        let events = feed(
            &mut grouper,
            &[
                "noise before anything",
                "ERROR something broke",
                "    at com.example.Foo",
                "Caused by: IOException",
                "    at com.example.Bar",
                "INFO unrelated",
            ],
        );
        assert_eq!(
            events,
            vec![
                "ERROR something broke\n    at com.example.Foo\nCaused by: IOException\n    at com.example.Bar"
            ]
        );
    }

    #[test]
    fn test_prefix_garbage_mode() {
        let mut cfg = config(MultilineMode::PrefixGarbage);
        cfg.multiline_prefix = Some("^BEGIN".to_string());
        cfg.multiline_garbage = Some("^--".to_string());
        cfg.multiline_drop_garbage = false;

        let mut grouper = MultilineGrouper::from_config(&cfg);
        let events = feed(
            &mut grouper,
            &["BEGIN tx 1", "insert a", "-- done", "BEGIN tx 2", "insert b", "BEGIN tx 3"],
        );
        assert_eq!(
            events,
            vec!["BEGIN tx 1\ninsert a", "-- done", "BEGIN tx 2\ninsert b"]
        );
    }

    #[test]
    fn test_prefix_suffix_mode() {
        let mut cfg = config(MultilineMode::PrefixSuffix);
        cfg.multiline_prefix = Some("^<msg".to_string());
        cfg.multiline_suffix = Some("</msg>".to_string());

        let mut grouper = MultilineGrouper::from_config(&cfg);
        let events = feed(
            &mut grouper,
            &[
                "<msg a='1'>",
                "<txt>x",
                "y</txt>",
                "</msg>",
                "<msg a='2'>",
                "<txt>z</txt>",
                "</msg>",
            ],
        );
        assert_eq!(
            events,
            vec![
                "<msg a='1'>\n<txt>x\ny</txt>\n</msg>",
                "<msg a='2'>\n<txt>z</txt>\n</msg>",
            ]
        );
    }

    #[test]
    fn test_commit_offsets_follow_event_boundaries() {
        let mut grouper = MultilineGrouper::from_config(&config(MultilineMode::Indented));
        // "head\n" = 5 bytes, "  tail\n" = 7 bytes, "next\n" = 5 bytes.
        assert!(grouper.push_line("head", 5).is_empty());
        assert!(grouper.push_line("  tail", 12).is_empty());
        let closed = grouper.push_line("next", 17);
        assert_eq!(closed.len(), 1);
        // The closing line's bytes belong to the next event.
        assert_eq!(closed[0].end_offset, 12);
    }

    #[test]
    fn test_idle_flush() {
        let mut grouper = MultilineGrouper::from_config(&config(MultilineMode::Indented))
            .with_idle_timeout(Duration::from_millis(0));
        assert!(grouper.push_line("pending", 8).is_empty());
        let flushed = grouper.idle_flush().unwrap();
        assert_eq!(flushed.text, "pending");
        assert!(grouper.idle_flush().is_none());
    }
}
