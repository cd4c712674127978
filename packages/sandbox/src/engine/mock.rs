// ABOUTME: In-memory Engine used by unit tests
// ABOUTME: Simulates containers, a tiny shell and tar archive transfer without a daemon

use super::{
    ContainerSpec, ContainerStats, ContainerSummary, Engine, EngineError, ExecOutput, ExecRequest,
    Result,
};
use crate::types::SandboxStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub(crate) type ExecHook =
    Box<dyn Fn(&mut MockContainer, &ExecRequest) -> Option<ExecOutput> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct MockFile {
    pub data: Vec<u8>,
    pub ctime: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub spec: ContainerSpec,
    pub files: BTreeMap<String, MockFile>,
    pub dirs: BTreeSet<String>,
    pub logs: String,
}

impl MockContainer {
    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>, ctime: i64) {
        if let Some(parent) = Path::new(path).parent() {
            self.dirs.insert(parent.to_string_lossy().into_owned());
        }
        self.files.insert(
            path.to_string(),
            MockFile {
                data: data.into(),
                ctime,
            },
        );
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.dirs.contains(path) || self.files.keys().any(|k| k.starts_with(&prefix))
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir);
        let names: BTreeSet<String> = self
            .files
            .keys()
            .chain(self.dirs.iter())
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        names.into_iter().collect()
    }
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    images: HashSet<String>,
    builds: Vec<(PathBuf, String, String)>,
    reachable: bool,
    fail_start: bool,
    fail_create: bool,
    fail_build: bool,
    fail_remove: HashSet<String>,
    fail_stats: HashSet<String>,
    fail_exec: bool,
    archive_overrides: HashMap<String, Vec<u8>>,
    exec_calls: Vec<(String, ExecRequest)>,
    logs_requested: Vec<String>,
    installed: Vec<(String, String)>,
    install_result: (i64, String),
}

pub(crate) struct MockEngine {
    state: Mutex<MockState>,
    hook: Mutex<Option<ExecHook>>,
}

fn shell_ok(stdout: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: Vec::new(),
    }
}

fn shell_err(code: i64, stderr: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: Vec::new(),
        stderr: stderr.into(),
    }
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('\'').trim_matches('"')
}

impl MockEngine {
    pub fn new() -> Self {
        let state = MockState {
            reachable: true,
            images: HashSet::from(["python-sandbox:latest".to_string()]),
            install_result: (0, "Installed packages".to_string()),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            hook: Mutex::new(None),
        }
    }

    pub fn without_images() -> Self {
        let engine = Self::new();
        engine.state.lock().unwrap().images.clear();
        engine
    }

    pub fn unreachable() -> Self {
        let engine = Self::new();
        engine.state.lock().unwrap().reachable = false;
        engine
    }

    pub fn on_exec<F>(&self, hook: F)
    where
        F: Fn(&mut MockContainer, &ExecRequest) -> Option<ExecOutput> + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_string());
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn set_fail_build(&self, fail: bool) {
        self.state.lock().unwrap().fail_build = fail;
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    pub fn fail_remove_for(&self, id: &str) {
        self.state.lock().unwrap().fail_remove.insert(id.to_string());
    }

    pub fn fail_stats_for(&self, id: &str) {
        self.state.lock().unwrap().fail_stats.insert(id.to_string());
    }

    pub fn set_archive_override(&self, path: &str, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .archive_overrides
            .insert(path.to_string(), data);
    }

    pub fn set_installed(&self, packages: &[(&str, &str)]) {
        self.state.lock().unwrap().installed = packages
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
    }

    pub fn set_install_result(&self, exit_code: i64, output: &str) {
        self.state.lock().unwrap().install_result = (exit_code, output.to_string());
    }

    /// Insert a container directly, bypassing create
    pub fn seed_container(&self, name: &str, status: SandboxStatus) -> String {
        let id = Self::new_id();
        let spec = ContainerSpec {
            name: name.to_string(),
            image: "python-sandbox:latest".to_string(),
            labels: HashMap::from([("python-sandbox".to_string(), "true".to_string())]),
            working_dir: Some("/app/results".to_string()),
            command: None,
            binds: Vec::new(),
            limits: crate::config::DockerConfig::default()
                .resource_limits()
                .unwrap(),
        };
        let container = Self::container_from_spec(id.clone(), spec, status);
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(id.clone(), container);
        id
    }

    pub fn set_status(&self, id: &str, status: SandboxStatus) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.status = status;
        }
    }

    pub fn set_logs(&self, id: &str, logs: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.logs = logs.to_string();
        }
    }

    pub fn put_file(&self, id: &str, path: &str, data: &[u8], ctime: i64) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.write_file(path, data.to_vec(), ctime);
        }
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .and_then(|c| c.files.get(path).map(|f| f.data.clone()))
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .exec_calls
            .iter()
            .map(|(_, r)| r.cmd.clone())
            .collect()
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.state
            .lock()
            .unwrap()
            .exec_calls
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn builds(&self) -> Vec<(PathBuf, String, String)> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn logs_requested(&self) -> Vec<String> {
        self.state.lock().unwrap().logs_requested.clone()
    }

    fn new_id() -> String {
        format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        )
    }

    fn container_from_spec(id: String, spec: ContainerSpec, status: SandboxStatus) -> MockContainer {
        let mut dirs = BTreeSet::from(["/tmp".to_string()]);
        if let Some(dir) = &spec.working_dir {
            dirs.insert(dir.clone());
        }
        MockContainer {
            id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            status,
            created_at: Utc::now(),
            spec,
            files: BTreeMap::new(),
            dirs,
            logs: String::new(),
        }
    }

    fn summary(c: &MockContainer) -> ContainerSummary {
        ContainerSummary {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            status: c.status,
            created_at: c.created_at,
        }
    }

    fn find_id(state: &MockState, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        let trimmed = id_or_name.trim_start_matches('/');
        state
            .containers
            .values()
            .find(|c| c.name == trimmed || (trimmed.len() >= 12 && c.id.starts_with(trimmed)))
            .map(|c| c.id.clone())
    }

    fn check_reachable(state: &MockState) -> Result<()> {
        if state.reachable {
            Ok(())
        } else {
            Err(EngineError::Connection("mock engine unreachable".to_string()))
        }
    }

    fn run_builtin(
        container: &mut MockContainer,
        request: &ExecRequest,
        installed: &[(String, String)],
        install_result: &(i64, String),
    ) -> ExecOutput {
        let now = Utc::now().timestamp();
        let cmd: Vec<&str> = request.cmd.iter().map(String::as_str).collect();

        match cmd.as_slice() {
            ["sh", "-c", script] => {
                let script = script.trim();
                if let Some(path) = script.strip_prefix("cat > ") {
                    let data = request.stdin.clone().unwrap_or_default();
                    container.write_file(unquote(path), data, now);
                    shell_ok("")
                } else if let Some(path) = script.strip_prefix("rm -f ") {
                    container.files.remove(unquote(path));
                    shell_ok("")
                } else if script.contains("pip install") {
                    let (code, output) = install_result;
                    ExecOutput {
                        exit_code: *code,
                        stdout: output.clone().into_bytes(),
                        stderr: Vec::new(),
                    }
                } else if script.starts_with("pip list") {
                    let entries: Vec<serde_json::Value> = installed
                        .iter()
                        .map(|(n, v)| serde_json::json!({"name": n, "version": v}))
                        .collect();
                    shell_ok(serde_json::Value::Array(entries).to_string())
                } else if let Some(rest) = script.strip_prefix("echo ") {
                    shell_ok(format!("{}\n", unquote(rest)))
                } else if let Some(rest) = script.strip_prefix("exit ") {
                    shell_err(rest.trim().parse().unwrap_or(1), "")
                } else {
                    shell_err(127, format!("sh: {}: not found\n", script))
                }
            }
            ["ls", "-1", dir] => {
                let dir = dir.trim_end_matches('/');
                if !container.is_dir(dir) {
                    return shell_err(
                        2,
                        format!("ls: cannot access '{}': No such file or directory\n", dir),
                    );
                }
                let listing: String = container
                    .children(dir)
                    .into_iter()
                    .map(|n| format!("{}\n", n))
                    .collect();
                shell_ok(listing)
            }
            ["stat", "-c", "%n|%Z", path] => match container.files.get(*path) {
                Some(file) => shell_ok(format!("{}|{}\n", path, file.ctime)),
                None if container.is_dir(path) => shell_ok(format!("{}|{}\n", path, now)),
                None => shell_err(
                    1,
                    format!("stat: cannot statx '{}': No such file or directory\n", path),
                ),
            },
            _ => shell_ok(""),
        }
    }

    fn archive_for(container: &MockContainer, path: &str) -> Result<Vec<u8>> {
        let path = path.trim_end_matches('/');
        let base = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut builder = tar::Builder::new(Vec::new());

        if let Some(file) = container.files.get(path) {
            append_file(&mut builder, &base, &file.data)?;
        } else if container.is_dir(path) {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, format!("{}/", base), std::io::empty())?;

            let prefix = format!("{}/", path);
            for (name, file) in container.files.range(prefix.clone()..) {
                let Some(rest) = name.strip_prefix(&prefix) else {
                    break;
                };
                append_file(&mut builder, &format!("{}/{}", base, rest), &file.data)?;
            }
        } else {
            return Err(EngineError::NotFound(format!(
                "Could not find the file {} in container {}",
                path, container.id
            )));
        }

        Ok(builder.into_inner()?)
    }
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

#[async_trait]
impl Engine for MockEngine {
    async fn ping(&self) -> Result<()> {
        Self::check_reachable(&self.state.lock().unwrap())
    }

    async fn version(&self) -> Result<String> {
        Ok("mock-1.0".to_string())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.images.contains(image))
    }

    async fn build_image(&self, context_dir: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_build {
            return Err(EngineError::Build("mock build failure".to_string()));
        }
        state
            .builds
            .push((context_dir.to_path_buf(), dockerfile.to_string(), tag.to_string()));
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        if state.fail_create {
            return Err(EngineError::Api {
                status: 500,
                message: "mock create failure".to_string(),
            });
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        let id = Self::new_id();
        let container = Self::container_from_spec(id.clone(), spec.clone(), SandboxStatus::Created);
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let fail = state.fail_start;
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if fail {
            return Err(EngineError::Api {
                status: 500,
                message: "mock start failure".to_string(),
            });
        }
        if let Some(c) = state.containers.get_mut(&id) {
            c.status = SandboxStatus::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace_secs: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if !container.status.is_running() {
            return Err(EngineError::NotModified(id));
        }
        container.status = SandboxStatus::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if state.fail_remove.contains(&id) {
            return Err(EngineError::Api {
                status: 500,
                message: "mock remove failure".to_string(),
            });
        }
        let running = state
            .containers
            .get(&id)
            .map(|c| c.status.is_running())
            .unwrap_or(false);
        if running && !force {
            return Err(EngineError::Api {
                status: 409,
                message: "container is running".to_string(),
            });
        }
        state.containers.remove(&id);
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Self::find_id(&state, id_or_name)
            .and_then(|id| state.containers.get(&id))
            .map(Self::summary)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id_or_name)))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state
            .containers
            .values()
            .filter(|c| c.labels.get(label).map(String::as_str) == Some("true"))
            .map(Self::summary)
            .collect())
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        state.exec_calls.push((id.clone(), request.clone()));
        if state.fail_exec {
            return Err(EngineError::Connection("mock exec failure".to_string()));
        }

        let installed = state.installed.clone();
        let install_result = state.install_result.clone();
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if !container.status.is_running() {
            return Err(EngineError::Api {
                status: 409,
                message: format!("Container {} is not running", id),
            });
        }

        let hooked = self
            .hook
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|hook| hook(container, &request));

        let mut output = match hooked {
            Some(output) => output,
            None => Self::run_builtin(container, &request, &installed, &install_result),
        };

        if request.output == super::OutputMode::Combined {
            let stderr = std::mem::take(&mut output.stderr);
            output.stdout.extend_from_slice(&stderr);
        }
        Ok(output)
    }

    async fn logs(&self, id: &str, _tail: usize) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        state.logs_requested.push(id.clone());
        Ok(state
            .containers
            .get(&id)
            .map(|c| c.logs.clone())
            .unwrap_or_default())
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if let Some(data) = state.archive_overrides.get(path) {
            return Ok(data.clone());
        }
        let container = state
            .containers
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        Self::archive_for(container, path)
    }

    async fn put_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        let now = Utc::now().timestamp();
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data)?;
            let dest = format!("{}/{}", dest_dir.trim_end_matches('/'), name);
            container.write_file(&dest, data, now);
        }
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let state = self.state.lock().unwrap();
        let id = Self::find_id(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if state.fail_stats.contains(&id) {
            return Err(EngineError::Stream("mock stats failure".to_string()));
        }
        Ok(ContainerStats {
            cpu_total_usage: 2_000,
            precpu_total_usage: 1_000,
            system_cpu_usage: 20_000,
            presystem_cpu_usage: 10_000,
            online_cpus: 1,
            memory_usage: 64 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
        })
    }
}
