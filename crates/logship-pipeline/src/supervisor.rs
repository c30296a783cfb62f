use crate::pipeline::{EnrichSpec, WatchedPattern, Worker, WorkerInput};
use crate::registry;
use logship_core::config::{Config, InputConfig};
use logship_core::ShipError;
use logship_input::watcher::expand_paths;
use logship_input::{FileInput, LumberjackSource, PathWatcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often missing workers are respawned.
const SPAWN_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum delay before a crashed worker is respawned.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// How long soft termination waits for workers to drain before the
/// survivors are killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// A process group: the inputs it owns and how many workers run them.
struct GroupSpec {
    name: String,
    input_indexes: Vec<usize>,
    workers: usize,
}

/// Inputs without a `workers` setting share one implicit group; each input
/// with `workers = N` forms its own group. File inputs are forced to one
/// worker because tailer state is per file.
fn form_groups(inputs: &[InputConfig]) -> Vec<GroupSpec> {
    let mut implicit = Vec::new();
    let mut groups = Vec::new();
    for (index, input) in inputs.iter().enumerate() {
        match input.common().workers {
            None | Some(0) => implicit.push(index),
            Some(_) => {
                let workers = input.workers();
                groups.push(GroupSpec {
                    name: format!("group{}", index),
                    input_indexes: vec![index],
                    workers,
                });
            }
        }
    }
    if !implicit.is_empty() {
        groups.insert(
            0,
            GroupSpec {
                name: "main".to_string(),
                input_indexes: implicit,
                workers: 1,
            },
        );
    }
    groups
}

struct Slot {
    group_index: usize,
    worker_index: usize,
    respawn_at: Option<Instant>,
}

/// Spawns the configured worker tasks, respawns crashed ones, and handles
/// soft shutdown: stop, drain for up to 15 seconds, kill survivors.
pub struct Supervisor {
    config: Config,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    pub async fn run(self) -> Result<(), ShipError> {
        let worker_cancel = CancellationToken::new();

        // Listeners bind once and are shared by their group's workers, so a
        // respawned worker never fights over the port.
        let mut sources: HashMap<usize, LumberjackSource> = HashMap::new();
        for (index, input) in self.config.inputs.iter().enumerate() {
            if let InputConfig::Lumberjack(c) = input {
                sources.insert(
                    index,
                    LumberjackSource::start(c, worker_cancel.child_token()).await?,
                );
            }
        }

        let groups = form_groups(&self.config.inputs);
        let mut slots = Vec::new();
        for (group_index, group) in groups.iter().enumerate() {
            for worker_index in 0..group.workers {
                slots.push(Slot {
                    group_index,
                    worker_index,
                    respawn_at: None,
                });
            }
        }
        info!(
            groups = groups.len(),
            workers = slots.len(),
            "Supervisor starting"
        );

        let mut tasks: JoinSet<usize> = JoinSet::new();
        let mut task_slots: HashMap<tokio::task::Id, usize> = HashMap::new();

        for slot_index in 0..slots.len() {
            let slot = &slots[slot_index];
            let worker = build_worker(
                &self.config,
                &groups[slot.group_index],
                slot.worker_index,
                &sources,
            )?;
            let cancel = worker_cancel.child_token();
            let handle = tasks.spawn(async move {
                worker.run(cancel).await;
                slot_index
            });
            task_slots.insert(handle.id(), slot_index);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let slot_index = match joined {
                        Some(Ok((id, slot_index))) => {
                            task_slots.remove(&id);
                            slot_index
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Worker crashed");
                            match task_slots.remove(&e.id()) {
                                Some(slot_index) => slot_index,
                                None => continue,
                            }
                        }
                        None => continue,
                    };
                    if !worker_cancel.is_cancelled() {
                        warn!(slot = slot_index, "Worker exited, scheduling respawn");
                        slots[slot_index].respawn_at = Some(Instant::now() + RESPAWN_DELAY);
                    }
                }
                _ = tokio::time::sleep(SPAWN_INTERVAL) => {
                    self.spawn_due(
                        &mut slots,
                        &groups,
                        &sources,
                        &worker_cancel,
                        &mut tasks,
                        &mut task_slots,
                    );
                }
            }
        }

        info!("Stopping workers");
        worker_cancel.cancel();
        let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(survivors = tasks.len(), "Drain timeout, killing workers");
                    tasks.shutdown().await;
                    break;
                }
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        info!("Supervisor stopped");
        Ok(())
    }

    fn spawn_due(
        &self,
        slots: &mut [Slot],
        groups: &[GroupSpec],
        sources: &HashMap<usize, LumberjackSource>,
        worker_cancel: &CancellationToken,
        tasks: &mut JoinSet<usize>,
        task_slots: &mut HashMap<tokio::task::Id, usize>,
    ) {
        let now = Instant::now();
        for slot_index in 0..slots.len() {
            let due = slots[slot_index]
                .respawn_at
                .is_some_and(|at| at <= now);
            if !due {
                continue;
            }
            let slot = &mut slots[slot_index];
            match build_worker(
                &self.config,
                &groups[slot.group_index],
                slot.worker_index,
                sources,
            ) {
                Ok(worker) => {
                    slot.respawn_at = None;
                    let cancel = worker_cancel.child_token();
                    let handle = tasks.spawn(async move {
                        worker.run(cancel).await;
                        slot_index
                    });
                    task_slots.insert(handle.id(), slot_index);
                    info!(slot = slot_index, "Worker respawned");
                }
                Err(e) => {
                    error!(slot = slot_index, error = %e, "Respawn failed, retrying");
                    slot.respawn_at = Some(now + RESPAWN_DELAY);
                }
            }
        }
    }
}

fn build_worker(
    config: &Config,
    group: &GroupSpec,
    worker_index: usize,
    sources: &HashMap<usize, LumberjackSource>,
) -> Result<Worker, ShipError> {
    let libdir = PathBuf::from(&config.general.libdir);
    let mut inputs = Vec::new();
    let mut watched = Vec::new();

    for &index in &group.input_indexes {
        match &config.inputs[index] {
            InputConfig::File(c) => {
                let spec_source = &c.common;
                let paths = expand_paths(c.path.as_slice());
                for path in &paths {
                    let input = FileInput::new(c, path.clone(), &libdir, c.start_position);
                    inputs.push(WorkerInput::new(
                        Box::new(input),
                        EnrichSpec::from_common(spec_source)?,
                        Some(path.clone()),
                    ));
                }
                let watcher = PathWatcher::new(
                    c.path.clone().into_vec(),
                    config.general.watch_interval(),
                    paths,
                );
                if watcher.is_active() {
                    watched.push(WatchedPattern {
                        watcher,
                        config: c.clone(),
                    });
                }
            }
            InputConfig::Lumberjack(c) => {
                let source = sources.get(&index).ok_or_else(|| {
                    ShipError::Config("lumberjack listener not bound".to_string())
                })?;
                inputs.push(WorkerInput::new(
                    Box::new(source.consumer()),
                    EnrichSpec::from_common(&c.common)?,
                    None,
                ));
            }
        }
    }

    let outputs = registry::build_outputs(&config.outputs)?;
    Ok(Worker::new(
        format!("{}/{}", group.name, worker_index),
        inputs,
        outputs,
        watched,
        libdir,
        config.general.poll_interval(),
        config.general.lines,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::Config;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn test_group_formation() {
        let toml = r#"
[[input]]
input = "file"
type = "app"
path = "/a"

[[input]]
input = "file"
type = "db"
path = "/b"

[[input]]
input = "lumberjack"
type = "net"
port = 5044
workers = 3
ssl_cert_file = "/cert"
ssl_key_file = "/key"

[[output]]
output = "screen"
type = "*"
"#;
        let config = Config::from_str(toml).unwrap();
        let groups = form_groups(&config.inputs);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "main");
        assert_eq!(groups[0].input_indexes, vec![0, 1]);
        assert_eq!(groups[0].workers, 1);
        assert_eq!(groups[1].input_indexes, vec![2]);
        assert_eq!(groups[1].workers, 3);
    }

    #[test]
    fn test_file_inputs_single_worker_group() {
        let toml = r#"
[[input]]
input = "file"
type = "app"
path = "/a"
workers = 8

[[output]]
output = "screen"
type = "*"
"#;
        let config = Config::from_str(toml).unwrap();
        let groups = form_groups(&config.inputs);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].workers, 1);
    }

    #[tokio::test]
    async fn test_supervisor_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("app.log");
        let out_path = dir.path().join("out.jsonl");
        let mut file = std::fs::File::create(&log_path).unwrap();
        file.write_all(b"L1\nL2\n").unwrap();
        file.flush().unwrap();

        let toml = format!(
            r#"
[general]
libdir = "{libdir}"
poll = 100

[[input]]
input = "file"
type = "app"
path = "{input}"
start_position = "begin"

[[output]]
output = "file"
type = "app"
path = "{output}"
"#,
            libdir = dir.path().display(),
            input = log_path.display(),
            output = out_path.display(),
        );
        let config = Config::from_str(&toml).unwrap();

        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(config, shutdown.clone());
        let handle = tokio::spawn(supervisor.run());

        // Give the worker a few polls to ship the two lines.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if out_path.exists()
                && std::fs::read_to_string(&out_path).unwrap().lines().count() == 2
            {
                break;
            }
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let content = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"line\":\"L1\""));
    }
}
