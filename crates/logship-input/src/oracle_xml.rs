use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::multiline::IDLE_FLUSH;

/// Marker opening a TNS multi-message: a run of 71 asterisks.
const TNS_MARKER: &str =
    "***********************************************************************";

/// Closure of a TNS message requires at least the Time line to have been
/// seen; unrelated envelopes arriving earlier are emitted around the open
/// message instead of closing it.
const TNS_MIN_COMPLETE: u32 = 30;

/// One reassembled record from the Oracle XML alert log: the parsed
/// envelope attributes (emitted as `ora.*` fields) and the decoded text.
#[derive(Debug, Clone, PartialEq)]
pub struct OraRecord {
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub end_offset: u64,
}

impl OraRecord {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed `<msg ...><txt>...</txt></msg>` envelope.
#[derive(Debug, Clone)]
struct Envelope {
    attrs: Vec<(String, String)>,
    text: String,
    end_offset: u64,
    state: Option<u32>,
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\w.]+)\s*=\s*'([^']*)'").unwrap())
}

fn attr_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<attr\s+name\s*=\s*'([^']*)'\s+value\s*=\s*'([^']*)'").unwrap())
}

/// Decode the XML entity references Oracle writes into `<txt>` bodies.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let entity_end = rest.find(';').filter(|&end| end <= 8);
        match entity_end {
            Some(end) => {
                let entity = &rest[1..end];
                match entity {
                    "lt" => out.push('<'),
                    "gt" => out.push('>'),
                    "amp" => out.push('&'),
                    "quot" => out.push('"'),
                    "apos" => out.push('\''),
                    _ => {
                        let decoded = entity
                            .strip_prefix('#')
                            .and_then(|n| n.parse::<u32>().ok())
                            .and_then(char::from_u32);
                        match decoded {
                            Some(c) => out.push(c),
                            None => {
                                out.push('&');
                                out.push_str(entity);
                                out.push(';');
                            }
                        }
                    }
                }
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, PartialEq)]
enum ParseState {
    Idle,
    MsgTag,
    Body,
    Text,
    AfterText,
}

/// Line-oriented parser for the alert log envelope dialect: the `<msg>`
/// opening tag may span several physical lines, `<attr name='' value=''/>`
/// tags may precede the `<txt>` body, and the body runs until `</txt>`.
struct EnvelopeParser {
    state: ParseState,
    tag_buf: String,
    attrs: Vec<(String, String)>,
    text_lines: Vec<String>,
}

impl EnvelopeParser {
    fn new() -> Self {
        Self {
            state: ParseState::Idle,
            tag_buf: String::new(),
            attrs: Vec::new(),
            text_lines: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.state == ParseState::Idle
    }

    fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.tag_buf.clear();
        self.attrs.clear();
        self.text_lines.clear();
    }

    fn finish_tag(&mut self) {
        for caps in attr_regex().captures_iter(&self.tag_buf) {
            self.attrs
                .push((caps[1].to_string(), decode_entities(&caps[2])));
        }
        self.tag_buf.clear();
        self.state = ParseState::Body;
    }

    fn push_line(&mut self, line: &str, end_offset: u64) -> Option<Envelope> {
        match self.state {
            ParseState::Idle => {
                if line.trim_start().starts_with("<msg") {
                    self.tag_buf.push_str(line);
                    self.state = ParseState::MsgTag;
                    if self.tag_buf.contains('>') {
                        self.finish_tag();
                    }
                }
                None
            }
            ParseState::MsgTag => {
                self.tag_buf.push(' ');
                self.tag_buf.push_str(line);
                if self.tag_buf.contains('>') {
                    self.finish_tag();
                }
                None
            }
            ParseState::Body => {
                if let Some(caps) = attr_tag_regex().captures(line) {
                    self.attrs
                        .push((caps[1].to_string(), decode_entities(&caps[2])));
                    return None;
                }
                if let Some(after) = line.split_once("<txt>").map(|(_, rest)| rest) {
                    self.state = ParseState::Text;
                    return self.push_text(after, end_offset);
                }
                if line.contains("</msg>") {
                    // Envelope without a text body.
                    return Some(self.complete(end_offset));
                }
                None
            }
            ParseState::Text => self.push_text(line, end_offset),
            ParseState::AfterText => {
                if line.contains("</msg>") {
                    return Some(self.complete(end_offset));
                }
                None
            }
        }
    }

    fn push_text(&mut self, fragment: &str, end_offset: u64) -> Option<Envelope> {
        match fragment.split_once("</txt>") {
            Some((body, rest)) => {
                if !body.trim().is_empty() {
                    self.text_lines.push(body.to_string());
                }
                if rest.contains("</msg>") {
                    return Some(self.complete(end_offset));
                }
                self.state = ParseState::AfterText;
                None
            }
            None => {
                self.text_lines.push(fragment.to_string());
                None
            }
        }
    }

    fn complete(&mut self, end_offset: u64) -> Envelope {
        let text = decode_entities(&self.text_lines.join("\n"));
        let envelope = Envelope {
            attrs: std::mem::take(&mut self.attrs),
            state: tns_state(&text, 0),
            text,
            end_offset,
        };
        self.reset();
        envelope
    }

    /// Whatever has accumulated, rendered raw for an idle flush.
    fn flush_partial(&mut self, end_offset: u64) -> Option<Envelope> {
        if self.is_idle() {
            return None;
        }
        let mut parts = Vec::new();
        if !self.tag_buf.is_empty() {
            parts.push(self.tag_buf.clone());
        }
        parts.extend(self.text_lines.iter().cloned());
        let envelope = Envelope {
            attrs: std::mem::take(&mut self.attrs),
            text: parts.join("\n"),
            end_offset,
            state: None,
        };
        self.reset();
        Some(envelope)
    }
}

/// The TNS sub-message ladder. A line is classified by the first pattern it
/// matches; the plain `TNS-` code lines take the first free code slot above
/// the message's current state.
fn tns_state(text: &str, last_state: u32) -> Option<u32> {
    static TABLE: OnceLock<Vec<(Regex, u32)>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        [
            (r"^Fatal NI connect error", 10),
            (r"^\s*VERSION INFORMATION", 20),
            (r"^\s*Time:", 30),
            (r"^\s*Tracing", 40),
            (r"^\s*Tns error struct", 50),
            (r"^\s*nr err code", 60),
            (r"^\s*ns main err code", 80),
            (r"^\s*ns secondary err code", 100),
            (r"^\s*nt main err code", 110),
            (r"^\s*nt secondary err code", 130),
            (r"^\s*nt OS err code", 140),
            (r"^\s*Client address", 150),
        ]
        .into_iter()
        .map(|(pattern, state)| (Regex::new(pattern).unwrap(), state))
        .collect()
    });

    let first_line = text.lines().next().unwrap_or("");
    for (re, state) in table {
        if re.is_match(first_line) {
            return Some(*state);
        }
    }

    static TNS_CODE: OnceLock<Regex> = OnceLock::new();
    let tns_code = TNS_CODE.get_or_init(|| Regex::new(r"^\s*TNS-\d").unwrap());
    if tns_code.is_match(first_line) {
        // Code slots follow the nr/ns/nt err-code lines at 60/80/110.
        let slot = [70u32, 90, 120]
            .into_iter()
            .find(|&slot| slot > last_state)
            .unwrap_or(70);
        return Some(slot);
    }
    None
}

fn is_tns_marker(text: &str) -> bool {
    text.lines().next().unwrap_or("").starts_with(TNS_MARKER)
}

fn is_tns_continuation(text: &str) -> bool {
    let first_line = text.lines().next().unwrap_or("");
    first_line.starts_with(' ')
        || first_line.starts_with('\t')
        || first_line.starts_with("TNS-")
        || first_line.starts_with("Fatal NI connect error")
}

fn set_attr(attrs: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (k, v) in attrs.iter_mut() {
        if k == name {
            *v = value.to_string();
            return;
        }
    }
    attrs.push((name.to_string(), value.to_string()));
}

/// An open TNS multi-message being assembled.
struct TnsMessage {
    attrs: Vec<(String, String)>,
    texts: Vec<String>,
    last_state: u32,
    end_offset: u64,
}

impl TnsMessage {
    fn from_envelope(envelope: Envelope) -> Self {
        // The opening envelope may already carry the first sub-message line.
        let last_state = tns_state(&envelope.text, 0).unwrap_or(0);
        Self {
            attrs: envelope.attrs,
            texts: vec![envelope.text],
            last_state,
            end_offset: envelope.end_offset,
        }
    }

    fn append(&mut self, envelope: Envelope, state: Option<u32>) {
        self.texts.push(envelope.text);
        self.end_offset = self.end_offset.max(envelope.end_offset);
        if let Some(state) = state {
            self.last_state = state;
        }
    }

    fn into_record(mut self, ora_type: &str) -> OraRecord {
        set_attr(&mut self.attrs, "type", ora_type);
        OraRecord {
            attrs: self.attrs,
            text: self.texts.join("\n"),
            end_offset: self.end_offset,
        }
    }
}

/// Grouper for the Oracle RDBMS/listener alert log XML dialect.
///
/// Every envelope becomes one candidate record. When an envelope's text
/// opens with the TNS marker, subsequent continuation envelopes are joined
/// into one logical record; sub-messages arriving out of their canonical
/// order are parked in a backlog and reassembled greedily at closure.
/// Residue that cannot be chained is emitted with `type = "TNS mess"`.
pub struct OracleXmlGrouper {
    parser: EnvelopeParser,
    current: Option<TnsMessage>,
    backlog: Vec<Envelope>,
    last_was_backlogged: bool,
    last_offset: u64,
    last_activity: Instant,
    idle_timeout: Duration,
}

impl OracleXmlGrouper {
    pub fn new() -> Self {
        Self {
            parser: EnvelopeParser::new(),
            current: None,
            backlog: Vec::new(),
            last_was_backlogged: false,
            last_offset: 0,
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
        self.parser.is_idle() && self.current.is_none() && self.backlog.is_empty()
    }

    pub fn push_line(&mut self, line: &str, end_offset: u64) -> Vec<OraRecord> {
        self.last_activity = Instant::now();
        self.last_offset = end_offset;
        match self.parser.push_line(line, end_offset) {
            Some(envelope) => self.process_envelope(envelope),
            None => Vec::new(),
        }
    }

    fn process_envelope(&mut self, envelope: Envelope) -> Vec<OraRecord> {
        let mut out = Vec::new();

        if self.current.is_some() {
            if is_tns_continuation(&envelope.text) {
                self.absorb_continuation(envelope);
                return out;
            }
            let message = self.current.as_ref().expect("current message");
            if message.last_state < TNS_MIN_COMPLETE {
                // Unrelated envelope interleaved with an incomplete TNS
                // message: ship it around the open message.
                out.push(plain_record(envelope));
                return out;
            }
            out.extend(self.close_current());
        }

        if is_tns_marker(&envelope.text) {
            self.current = Some(TnsMessage::from_envelope(envelope));
        } else {
            out.push(plain_record(envelope));
        }
        out
    }

    fn absorb_continuation(&mut self, mut envelope: Envelope) {
        let message = self.current.as_mut().expect("current message");
        match tns_state(&envelope.text, message.last_state) {
            Some(state) if state <= message.last_state => {
                // A lower-or-equal state after a higher one: two messages
                // are interleaved. Park the envelope for reassembly.
                envelope.state = Some(state);
                self.backlog.push(envelope);
                self.last_was_backlogged = true;
            }
            state => {
                if state.is_none() && self.last_was_backlogged {
                    // Stateless continuation of a parked message.
                    envelope.state = None;
                    self.backlog.push(envelope);
                } else {
                    message.append(envelope, state);
                    self.last_was_backlogged = false;
                }
            }
        }
    }

    fn close_current(&mut self) -> Vec<OraRecord> {
        let mut out = Vec::new();
        if let Some(message) = self.current.take() {
            out.push(message.into_record("TNS"));
        }
        self.last_was_backlogged = false;
        out.extend(self.resolve_backlog());
        out
    }

    /// Greedily rebuild additional TNS messages from the backlog: each pass
    /// seeds from the first parked NI line and chains envelopes with
    /// ascending states, carrying stateless envelopes along with their
    /// predecessor. Whatever never chains is marked lossy.
    fn resolve_backlog(&mut self) -> Vec<OraRecord> {
        let mut out = Vec::new();
        let mut leftovers = std::mem::take(&mut self.backlog);

        loop {
            let Some(seed_at) = leftovers.iter().position(|e| e.state == Some(10)) else {
                break;
            };
            let seed = leftovers.remove(seed_at);
            let mut message = TnsMessage::from_envelope(seed);

            let mut index = seed_at;
            let mut chained_previous = true;
            while index < leftovers.len() {
                let state = leftovers[index].state;
                let take = match state {
                    Some(state) => state > message.last_state,
                    None => chained_previous,
                };
                if take {
                    let envelope = leftovers.remove(index);
                    let state = envelope.state;
                    message.append(envelope, state);
                    chained_previous = true;
                } else {
                    chained_previous = false;
                    index += 1;
                }
            }
            out.push(message.into_record("TNS"));
        }

        for envelope in leftovers {
            let mut record = plain_record(envelope);
            set_attr(&mut record.attrs, "type", "TNS mess");
            out.push(record);
        }
        out
    }

    /// Emit everything held when no line arrived for the idle timeout.
    pub fn idle_flush(&mut self) -> Vec<OraRecord> {
        if self.is_empty() || self.last_activity.elapsed() < self.idle_timeout {
            return Vec::new();
        }
        self.flush()
    }

    /// Unconditionally emit the open message, the backlog, and any partial
    /// envelope.
    pub fn flush(&mut self) -> Vec<OraRecord> {
        self.last_activity = Instant::now();
        let mut out = self.close_current();
        if let Some(partial) = self.parser.flush_partial(self.last_offset) {
            out.push(plain_record(partial));
        }
        out
    }
}

impl Default for OracleXmlGrouper {
    fn default() -> Self {
        Self::new()
    }
}

fn plain_record(envelope: Envelope) -> OraRecord {
    OraRecord {
        attrs: envelope.attrs,
        text: envelope.text,
        end_offset: envelope.end_offset,
    }
}
