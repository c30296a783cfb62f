use crate::registry::BuiltOutput;
use logship_core::config::{
    AddFieldRule, CommonInputConfig, FileInputConfig, PayloadFormat, StartPosition,
};
use logship_core::{Event, Input, ShipError, TimestampCache};
use logship_input::{FileInput, PathWatcher};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Benchmark counter reporting interval, in events.
const BENCHMARK_EVERY: u64 = 10_000;

struct CompiledRule {
    key: String,
    field: String,
    regex: Regex,
    template: String,
    default: Option<String>,
}

/// Per-input enrichment: declared type, tags, static and derived fields.
pub struct EnrichSpec {
    pub event_type: Option<String>,
    format: PayloadFormat,
    tags: Vec<String>,
    add_field: BTreeMap<String, String>,
    rules: Vec<CompiledRule>,
}

impl EnrichSpec {
    pub fn from_common(common: &CommonInputConfig) -> Result<Self, ShipError> {
        let rules = common
            .add_field_rules
            .iter()
            .map(|rule| compile_rule(rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            event_type: common.event_type.clone(),
            format: common.format,
            tags: common.tags.clone(),
            add_field: common.add_field.clone(),
            rules,
        })
    }
}

fn compile_rule(rule: &AddFieldRule) -> Result<CompiledRule, ShipError> {
    Ok(CompiledRule {
        key: rule.key.clone(),
        field: rule.field.clone(),
        regex: rule.compile()?,
        template: rule.template.clone(),
        default: rule.default.clone(),
    })
}

/// One input owned by a worker, with its poll and removal state.
pub struct WorkerInput {
    pub input: Box<dyn Input>,
    pub spec: EnrichSpec,
    /// Concrete path for watcher bookkeeping; network inputs have none.
    pub path: Option<PathBuf>,
    next_poll: Instant,
    remove: bool,
}

impl WorkerInput {
    pub fn new(input: Box<dyn Input>, spec: EnrichSpec, path: Option<PathBuf>) -> Self {
        Self {
            input,
            spec,
            path,
            next_poll: Instant::now(),
            remove: false,
        }
    }
}

/// Events whose push failed, pending retry against one output.
struct StashEntry {
    output_index: usize,
    events: Vec<Event>,
}

/// A wildcard watcher together with the input config its discoveries
/// inherit.
pub struct WatchedPattern {
    pub watcher: PathWatcher,
    pub config: FileInputConfig,
}

/// The per-worker pipeline: pull, enrich, dispatch per output type, stash
/// on failure, and drain the stash in order before pulling again.
pub struct Worker {
    name: String,
    inputs: Vec<WorkerInput>,
    outputs: Vec<BuiltOutput>,
    watched: Vec<WatchedPattern>,
    libdir: PathBuf,
    failed: HashMap<String, Vec<StashEntry>>,
    timestamps: TimestampCache,
    poll: Duration,
    lines: usize,
    processed: u64,
    last_reported: u64,
    benchmark_start: Instant,
}

impl Worker {
    pub fn new(
        name: String,
        inputs: Vec<WorkerInput>,
        outputs: Vec<BuiltOutput>,
        watched: Vec<WatchedPattern>,
        libdir: PathBuf,
        poll: Duration,
        lines: usize,
    ) -> Self {
        Self {
            name,
            inputs,
            outputs,
            watched,
            libdir,
            failed: HashMap::new(),
            timestamps: TimestampCache::new(),
            poll,
            lines,
            processed: 0,
            last_reported: 0,
            benchmark_start: Instant::now(),
        }
    }

    /// Run until cancelled. Soft termination finishes the current tick, so
    /// in-flight pushes complete; anything left in the stash is abandoned
    /// and re-read from the committed offsets on restart.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(worker = %self.name, inputs = self.inputs.len(), "Worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let tick_start = Instant::now();
            self.tick().await;

            let elapsed = tick_start.elapsed();
            if elapsed < self.poll {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll - elapsed) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        info!(worker = %self.name, "Worker stopped");
    }

    pub(crate) async fn tick(&mut self) {
        self.rotate_watchers();
        self.reap_inputs();

        let now = Instant::now();
        for index in 0..self.inputs.len() {
            if self.inputs[index].next_poll > now {
                continue;
            }

            let itype = self.inputs[index].spec.event_type.clone();
            if !self.failed.is_empty() && itype.is_none() {
                // Events of uncertain type cannot be routed around a
                // failing output.
                continue;
            }
            if let Some(itype) = &itype {
                if self.failed.contains_key(itype) {
                    self.drain_stash(itype.clone()).await;
                    continue;
                }
            }

            let pulled = self.inputs[index].input.pull(self.lines).await;
            let events = match pulled {
                Ok(events) => events,
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.name, error = %e, "Input failed, destroying");
                    self.inputs[index].remove = true;
                    continue;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Input error");
                    continue;
                }
            };
            if events.is_empty() {
                self.inputs[index].next_poll = Instant::now() + self.poll;
                continue;
            }

            let enriched = self.enrich(index, events);
            let stash_key = itype;
            self.ship(stash_key, enriched).await;
        }
    }

    fn rotate_watchers(&mut self) {
        let mut created = Vec::new();
        for watched in &mut self.watched {
            for path in watched.watcher.poll() {
                // Rotated-in successors are read from the beginning.
                let input = FileInput::new(
                    &watched.config,
                    path.clone(),
                    &self.libdir,
                    StartPosition::Begin,
                );
                match EnrichSpec::from_common(&watched.config.common) {
                    Ok(spec) => created.push(WorkerInput::new(Box::new(input), spec, Some(path))),
                    Err(e) => error!(error = %e, "Skipping discovered file"),
                }
            }
        }
        self.inputs.extend(created);
    }

    fn reap_inputs(&mut self) {
        let watched = &mut self.watched;
        self.inputs.retain(|input| {
            if input.remove {
                if let Some(path) = &input.path {
                    for watched in watched.iter_mut() {
                        watched.watcher.forget(path);
                    }
                }
                info!(path = ?input.path, "Input destroyed");
            }
            !input.remove
        });
    }

    fn enrich(&mut self, index: usize, events: Vec<Event>) -> Vec<Event> {
        let mut out = Vec::with_capacity(events.len());
        let timestamp = self.timestamps.now();
        for event in events {
            let spec = &self.inputs[index].spec;
            match enrich_event(event, spec, &timestamp) {
                Some(event) => out.push(event),
                None => debug!(worker = %self.name, "Dropped malformed record"),
            }
        }
        self.processed += out.len() as u64;
        if self.processed - self.last_reported >= BENCHMARK_EVERY {
            self.last_reported = self.processed;
            let elapsed = self.benchmark_start.elapsed().as_secs_f64();
            info!(
                worker = %self.name,
                processed = self.processed,
                rate = format!("{:.0}/s", self.processed as f64 / elapsed.max(0.001)),
                "Throughput"
            );
        }
        out
    }

    /// Dispatch enriched events: group by routing type, look up outputs
    /// bound to the type and to `*`, chunk into the adapter's window. The
    /// first failure per output stashes the remainder for that output and
    /// stops pushing to it this pass.
    async fn ship(&mut self, stash_key: Option<String>, events: Vec<Event>) {
        let groups = group_by_type(events);
        for (etype, group) in groups {
            let key = stash_key.clone().unwrap_or_else(|| etype.clone());
            let matching: Vec<usize> = self
                .outputs
                .iter()
                .enumerate()
                .filter(|(_, o)| o.accepts(&etype))
                .map(|(i, _)| i)
                .collect();
            if matching.is_empty() {
                debug!(worker = %self.name, event_type = %etype, "No output bound");
                continue;
            }
            for output_index in matching {
                if let Some(rest) = self.push_windows(output_index, &group).await {
                    self.failed.entry(key.clone()).or_default().push(StashEntry {
                        output_index,
                        events: rest,
                    });
                }
            }
        }
    }

    /// Push a group through one output in window-sized chunks. Returns the
    /// un-pushed remainder on failure.
    async fn push_windows(&mut self, output_index: usize, events: &[Event]) -> Option<Vec<Event>> {
        let output = &mut self.outputs[output_index];
        let window = output.adapter.max_window_size().max(1);
        let mut offset = 0;
        while offset < events.len() {
            let chunk = &events[offset..(offset + window).min(events.len())];
            match output.adapter.push(chunk).await {
                Ok(()) => offset += chunk.len(),
                Err(e) => {
                    error!(
                        worker = %self.name,
                        output = output.adapter.name(),
                        error = %e,
                        stashed = events.len() - offset,
                        "Push failed, stashing"
                    );
                    return Some(events[offset..].to_vec());
                }
            }
        }
        None
    }

    /// Retry stashed events in order. Pulls for the input type stay
    /// suppressed until everything is drained, which bounds memory and
    /// stops consuming input while the downstream is unavailable.
    async fn drain_stash(&mut self, itype: String) {
        let Some(mut entries) = self.failed.remove(&itype) else {
            return;
        };
        while !entries.is_empty() {
            let entry = &mut entries[0];
            let events = std::mem::take(&mut entry.events);
            match self.push_windows(entry.output_index, &events).await {
                None => {
                    entries.remove(0);
                }
                Some(rest) => {
                    entries[0].events = rest;
                    self.failed.insert(itype, entries);
                    return;
                }
            }
        }
        info!(worker = %self.name, input_type = %itype, "Stash drained");
    }

    #[cfg(test)]
    pub(crate) fn stashed_count(&self, itype: &str) -> usize {
        self.failed
            .get(itype)
            .map(|entries| entries.iter().map(|e| e.events.len()).sum())
            .unwrap_or(0)
    }
}

/// Group events by routing type, preserving input order within each group
/// and the order in which types first appear.
fn group_by_type(events: Vec<Event>) -> Vec<(String, Vec<Event>)> {
    let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(t, _)| *t == event.event_type) {
            Some((_, group)) => group.push(event),
            None => groups.push((event.event_type.clone(), vec![event])),
        }
    }
    groups
}

/// Complete one event: parse `format = json` payloads, apply the declared
/// type, timestamp, tags, and field rules. Returns `None` for records that
/// must be dropped (malformed JSON).
fn enrich_event(mut event: Event, spec: &EnrichSpec, timestamp: &str) -> Option<Event> {
    if spec.format == PayloadFormat::Json {
        let parsed: Value = match serde_json::from_str(&event.line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, line = %event.line, "Malformed JSON line dropped");
                return None;
            }
        };
        let Value::Object(map) = parsed else {
            warn!(line = %event.line, "JSON line is not an object, dropped");
            return None;
        };
        let mut parsed = Event::from_json_map(map);
        // Carry over what the payload did not set itself.
        if parsed.host.is_empty() {
            parsed.host = std::mem::take(&mut event.host);
        }
        if parsed.file.is_empty() {
            parsed.file = std::mem::take(&mut event.file);
        }
        if parsed.source.is_empty() {
            parsed.source = std::mem::take(&mut event.source);
        }
        if parsed.line.is_empty() {
            parsed.line = std::mem::take(&mut event.line);
        }
        event = parsed;
    }

    // A type carried by the payload overrides the input's declared type.
    if event.event_type.is_empty() {
        event.event_type = spec.event_type.clone().unwrap_or_default();
    }
    if event.timestamp.is_empty() {
        event.timestamp = timestamp.to_string();
    }
    event.tags.extend(spec.tags.iter().cloned());
    for (key, value) in &spec.add_field {
        event.set_field(key.clone(), value.clone());
    }
    for rule in &spec.rules {
        apply_rule(&mut event, rule);
    }
    Some(event)
}

fn apply_rule(event: &mut Event, rule: &CompiledRule) {
    let value = event.field_str(&rule.field).map(|s| s.to_string());
    let rendered = value.as_deref().and_then(|field_value| {
        rule.regex.captures(field_value).map(|caps| {
            let mut out = String::new();
            caps.expand(&rule.template, &mut out);
            out
        })
    });
    if let Some(rendered) = rendered.or_else(|| rule.default.clone()) {
        event.set_field(rule.key.clone(), rendered);
    }
}
