//! In-memory engine used by tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Engine, EngineRow, ExecOutput, RunSpec};
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub host_port: u16,
    pub labels: BTreeMap<String, String>,
    /// Absolute in-sandbox path -> content
    pub files: BTreeMap<String, String>,
    pub dirs: BTreeSet<String>,
    pub logs: String,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    images: Vec<String>,
    build_contexts: Vec<PathBuf>,
    dockerfiles: Vec<String>,
    next_id: u64,
    fail_build: Option<String>,
    fail_run: Option<String>,
    fail_stop: bool,
    fail_copy: HashSet<String>,
    archive_unavailable: bool,
    list_unavailable: bool,
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

fn failed(command: &str, stderr: &str) -> SandboxError {
    SandboxError::CommandFailed {
        command: command.to_string(),
        status: Some(1),
        stderr: stderr.to_string(),
    }
}

fn missing(id: &str) -> SandboxError {
    SandboxError::NotFound(format!("sandbox {}", id))
}

fn add_ancestors(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = Path::new(path);
    while let Some(parent) = current.parent() {
        let parent_str = parent.to_string_lossy().to_string();
        if parent_str.is_empty() {
            break;
        }
        dirs.insert(parent_str);
        current = parent;
    }
}

fn read_tree(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            read_tree(root, &path, out);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            let relative = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push((relative, content));
        }
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_build(&self, stderr: &str) {
        self.state.lock().unwrap().fail_build = Some(stderr.to_string());
    }

    pub fn fail_run(&self, stderr: &str) {
        self.state.lock().unwrap().fail_run = Some(stderr.to_string());
    }

    pub fn fail_stop(&self) {
        self.state.lock().unwrap().fail_stop = true;
    }

    /// Make `docker cp` into this in-sandbox path fail.
    pub fn fail_copy_to(&self, dest: &str) {
        self.state.lock().unwrap().fail_copy.insert(dest.to_string());
    }

    pub fn disable_archive(&self) {
        self.state.lock().unwrap().archive_unavailable = true;
    }

    pub fn disable_list(&self) {
        self.state.lock().unwrap().list_unavailable = true;
    }

    pub fn instance(&self, id: &str) -> Option<FakeInstance> {
        self.state.lock().unwrap().instances.get(id).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.clone()
    }

    pub fn build_contexts(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().build_contexts.clone()
    }

    pub fn dockerfiles(&self) -> Vec<String> {
        self.state.lock().unwrap().dockerfiles.clone()
    }

    /// Register an instance started outside this process.
    pub fn insert_running(&self, name: &str, host_port: u16, labels: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.instances.insert(
            id.clone(),
            FakeInstance {
                id: id.clone(),
                name: name.to_string(),
                image: "external".to_string(),
                running: true,
                host_port,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                logs: String::new(),
            },
        );
        id
    }

    fn with_instance<T>(&self, id: &str, f: impl FnOnce(&mut FakeInstance) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or_else(|| missing(id))?;
        f(instance)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<String> {
        let dockerfile = std::fs::read_to_string(context.join("Dockerfile"))
            .map_err(|e| SandboxError::io(context.join("Dockerfile"), e))?;
        let mut state = self.state.lock().unwrap();
        state.build_contexts.push(context.to_path_buf());
        state.dockerfiles.push(dockerfile);
        if let Some(stderr) = state.fail_build.clone() {
            return Err(failed("docker build", &stderr));
        }
        state.images.push(tag.to_string());
        Ok(format!("Successfully tagged {}\n", tag))
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut staged = Vec::new();
        read_tree(&spec.mount_source, &spec.mount_source, &mut staged);

        let mut state = self.state.lock().unwrap();
        if let Some(stderr) = state.fail_run.clone() {
            return Err(failed("docker run", &stderr));
        }
        if state.instances.values().any(|i| i.name == spec.name) {
            return Err(failed(
                "docker run",
                &format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);

        let mut dirs = BTreeSet::new();
        dirs.insert(spec.mount_target.clone());
        let mut files = BTreeMap::new();
        for (relative, content) in staged {
            let path = format!("{}/{}", spec.mount_target, relative);
            add_ancestors(&mut dirs, &path);
            files.insert(path, content);
        }

        state.instances.insert(
            id.clone(),
            FakeInstance {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: true,
                host_port: spec.host_port,
                labels: spec.labels.clone(),
                files,
                dirs,
                logs: "\u{1b}[32mready\u{1b}[0m - started server on 0.0.0.0:3000\n".to_string(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.with_instance(id, |instance| {
            instance.running = true;
            Ok(())
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let fail = self.state.lock().unwrap().fail_stop;
        self.with_instance(id, |instance| {
            if fail {
                return Err(failed("docker stop", "timeout waiting for container to stop"));
            }
            instance.running = false;
            Ok(())
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get(id) {
            None => Err(missing(id)),
            Some(instance) if instance.running => Err(failed(
                "docker rm",
                "You cannot remove a running container. Stop the container before attempting removal",
            )),
            Some(_) => {
                state.instances.remove(id);
                Ok(())
            }
        }
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<EngineRow>> {
        let state = self.state.lock().unwrap();
        if state.list_unavailable {
            return Err(SandboxError::EngineUnavailable("daemon down".to_string()));
        }
        let (key, value) = label_filter.split_once('=').unwrap_or((label_filter, ""));
        Ok(state
            .instances
            .values()
            .filter(|i| i.labels.get(key).map(String::as_str) == Some(value))
            .map(|i| EngineRow {
                id: i.id.clone(),
                name: i.name.clone(),
                state: Some(if i.running { "running" } else { "exited" }.to_string()),
                status_text: if i.running {
                    "Up 1 second".to_string()
                } else {
                    "Exited (0) 1 second ago".to_string()
                },
                host_ports: if i.running { vec![i.host_port] } else { Vec::new() },
                labels: i.labels.clone(),
                created_at: Some("2025-03-01 10:00:00 +0000 UTC".to_string()),
            })
            .collect())
    }

    async fn inspect_labels(&self, id: &str) -> Result<BTreeMap<String, String>> {
        self.with_instance(id, |instance| Ok(instance.labels.clone()))
    }

    async fn copy_in(&self, src: &Path, id: &str, dest: &str) -> Result<()> {
        let content =
            std::fs::read_to_string(src).map_err(|e| SandboxError::io(src.to_path_buf(), e))?;
        let fail = self.state.lock().unwrap().fail_copy.contains(dest);
        self.with_instance(id, |instance| {
            if fail {
                return Err(failed("docker cp", "write failed: no space left on device"));
            }
            let parent = Path::new(dest)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            if !instance.dirs.contains(&parent) {
                return Err(failed(
                    "docker cp",
                    &format!("Could not find the file {} in container", parent),
                ));
            }
            instance.files.insert(dest.to_string(), content);
            Ok(())
        })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        self.with_instance(id, |instance| {
            let ok = |stdout: String| ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            };
            let program = argv.first().map(String::as_str).unwrap_or_default();
            match program {
                "cat" => {
                    let path = argv.last().cloned().unwrap_or_default();
                    match instance.files.get(&path) {
                        Some(content) => Ok(ok(content.clone())),
                        None => Ok(ExecOutput {
                            stdout: String::new(),
                            stderr: format!("cat: {}: No such file or directory\n", path),
                            exit_code: Some(1),
                        }),
                    }
                }
                "mkdir" => {
                    for dir in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                        add_ancestors(&mut instance.dirs, &format!("{}/x", dir));
                    }
                    Ok(ok(String::new()))
                }
                "find" => {
                    let root = argv.get(1).cloned().unwrap_or_default();
                    let sep = if argv.iter().any(|a| a == "-print0") { "\0" } else { "\n" };
                    let listing: Vec<String> = instance
                        .files
                        .keys()
                        .filter(|p| p.starts_with(&format!("{}/", root)))
                        .map(|p| format!("{}{}", p, sep))
                        .collect();
                    Ok(ok(listing.concat()))
                }
                "sh" => Ok(ok(format!("ran: {}\n", argv.get(2).cloned().unwrap_or_default()))),
                other => Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!("{}: not found", other),
                    exit_code: Some(127),
                }),
            }
        })
    }

    async fn logs(&self, id: &str) -> Result<String> {
        self.with_instance(id, |instance| Ok(instance.logs.clone()))
    }

    async fn archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        if self.state.lock().unwrap().archive_unavailable {
            return Err(failed("docker cp", "archive not supported"));
        }
        self.with_instance(id, |instance| {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let mut builder = tar::Builder::new(Vec::new());

            for (file, content) in &instance.files {
                let Some(relative) = file.strip_prefix(&prefix) else {
                    continue;
                };
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("./{}", relative), content.as_bytes())
                    .map_err(|e| SandboxError::io(file, e))?;
            }
            builder.into_inner().map_err(|e| SandboxError::io(path, e))
        })
    }
}
