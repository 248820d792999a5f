use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PublicEndpoint, SupervisorConfig};
use crate::deps::DependencyManager;
use crate::error::{Error, Result};
use crate::scaffold;

const TAGGER_PACKAGE: &str = "vite-plugin-jsx-tagger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Lifecycle events fanned out to subscribers. Ordering is guaranteed per
/// project only; slow subscribers fall behind and drop per broadcast
/// semantics.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Started {
        project_id: String,
        port: u16,
    },
    Stopped {
        project_id: String,
    },
    Log {
        project_id: String,
        stream: LogStream,
        message: String,
    },
    Exited {
        project_id: String,
        code: Option<i32>,
    },
}

/// Read-only view of one instance record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub project_id: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub idle_seconds: u64,
}

struct InstanceRecord {
    port: u16,
    status: InstanceStatus,
    started_at: DateTime<Utc>,
    last_active: Instant,
    pid: Option<u32>,
    /// Fires once the slot resolves: the reaper observed the child's exit,
    /// or a failed boot released the slot. Present from record creation so
    /// a stop can wait on an instance that is still starting.
    exit_rx: watch::Receiver<bool>,
    /// Set by `stop()` while the instance is still starting; the boot task
    /// checks it before publishing and tears its child down instead.
    cancelled: bool,
}

impl InstanceRecord {
    fn snapshot(&self, project_id: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            project_id: project_id.to_string(),
            port: self.port,
            status: self.status,
            started_at: self.started_at,
            idle_seconds: self.last_active.elapsed().as_secs(),
        }
    }
}

struct State {
    instances: HashMap<String, InstanceRecord>,
    ports: BTreeSet<u16>,
}

struct Inner {
    config: SupervisorConfig,
    public: PublicEndpoint,
    hmr_path: String,
    tagger_dep: String,
    bun_binary: String,
    deps: Arc<DependencyManager>,
    http: reqwest::Client,
    state: Mutex<State>,
    events: broadcast::Sender<InstanceEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises one bundler child per project: port allocation, readiness,
/// crash reaping, idle eviction, graceful shutdown.
///
/// The port pool and instance table are owned exclusively by this type and
/// mutated only under one lock, so `|pool| + |instances|` always equals the
/// configured capacity.
#[derive(Clone)]
pub struct InstanceSupervisor {
    inner: Arc<Inner>,
}

impl InstanceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        public: PublicEndpoint,
        hmr_path: String,
        tagger_dep: String,
        bun_binary: String,
        deps: Arc<DependencyManager>,
        http: reqwest::Client,
    ) -> Self {
        let ports: BTreeSet<u16> = (0..config.max_instances as u16)
            .map(|i| config.base_port + i)
            .collect();
        let (events, _) = broadcast::channel(256);

        let supervisor = Self {
            inner: Arc::new(Inner {
                config,
                public,
                hmr_path,
                tagger_dep,
                bun_binary,
                deps,
                http,
                state: Mutex::new(State {
                    instances: HashMap::new(),
                    ports,
                }),
                events,
                sweeper: Mutex::new(None),
            }),
        };

        let sweeper = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.sweep_idle().await })
        };
        *supervisor.inner.sweeper.lock().expect("sweeper slot poisoned") = Some(sweeper);

        supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }

    /// Start the bundler for a project, or return the live instance if one
    /// is already up.
    pub async fn start(&self, project_id: &str, dir: &Path) -> Result<InstanceSnapshot> {
        let (exit_tx, exit_rx) = watch::channel(false);
        let port = {
            let mut state = self.inner.state.lock().expect("supervisor state poisoned");
            if let Some(record) = state.instances.get_mut(project_id) {
                match record.status {
                    InstanceStatus::Running | InstanceStatus::Starting
                        if !record.cancelled =>
                    {
                        record.last_active = Instant::now();
                        return Ok(record.snapshot(project_id));
                    }
                    // A stop is in flight; its reaper still owns the port.
                    _ => return Err(Error::Unavailable(project_id.to_string())),
                }
            }
            let Some(port) = state.ports.iter().next().copied() else {
                return Err(Error::NoCapacity(self.inner.config.max_instances));
            };
            state.ports.remove(&port);
            state.instances.insert(
                project_id.to_string(),
                InstanceRecord {
                    port,
                    status: InstanceStatus::Starting,
                    started_at: Utc::now(),
                    last_active: Instant::now(),
                    pid: None,
                    exit_rx,
                    cancelled: false,
                },
            );
            port
        };

        match self.boot(project_id, dir, port, exit_tx.clone()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                // Every boot failure path has already reaped its child, so
                // the port really is free again. Signal anyone waiting on
                // the slot (a concurrent stop) that it has resolved.
                self.release_slot(project_id);
                let _ = exit_tx.send(true);
                Err(err)
            }
        }
    }

    async fn boot(
        &self,
        project_id: &str,
        dir: &Path,
        port: u16,
        exit_tx: watch::Sender<bool>,
    ) -> Result<InstanceSnapshot> {
        self.preflight(project_id, dir).await?;

        info!(project = project_id, port, "starting bundler");
        let mut child = Command::new(&self.inner.bun_binary)
            .arg("run")
            .arg("vite")
            .arg("--host")
            .arg("0.0.0.0")
            .arg("--port")
            .arg(port.to_string())
            .arg("--strictPort")
            .current_dir(dir)
            .env("NODE_ENV", "development")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn bundler: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_pump(project_id, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_pump(project_id, LogStream::Stderr, stderr);
        }

        self.wait_ready(project_id, port, &mut child).await?;

        let pid = child.id();
        let published = {
            let mut state = self.inner.state.lock().expect("supervisor state poisoned");
            match state.instances.get_mut(project_id) {
                Some(record) if !record.cancelled => {
                    record.status = InstanceStatus::Running;
                    record.pid = pid;
                    record.last_active = Instant::now();
                    Some(record.snapshot(project_id))
                }
                // Stopped or deleted while we were becoming ready; the
                // child is ours to tear down, and the slot is released by
                // the error path in `start`.
                _ => None,
            }
        };
        let Some(snapshot) = published else {
            info!(project = project_id, port, "startup cancelled by stop");
            let _ = child.kill().await;
            return Err(Error::Unavailable(project_id.to_string()));
        };

        self.spawn_reaper(project_id, child, exit_tx);
        self.emit(InstanceEvent::Started {
            project_id: project_id.to_string(),
            port,
        });
        info!(project = project_id, port, "bundler ready");
        Ok(snapshot)
    }

    /// Poll the child's HTTP port until it answers. 200 and 404 both count:
    /// the dev server may have no index route yet.
    async fn wait_ready(&self, project_id: &str, port: u16, child: &mut Child) -> Result<()> {
        let url = format!("http://127.0.0.1:{port}/");
        let deadline = Instant::now() + self.inner.config.start_timeout;

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::Internal(format!(
                    "bundler for {project_id} exited during startup with {:?}",
                    status.code()
                )));
            }
            if Instant::now() >= deadline {
                warn!(project = project_id, port, "bundler readiness deadline expired");
                let _ = child.kill().await;
                return Err(Error::StartupTimeout {
                    project_id: project_id.to_string(),
                    timeout: self.inner.config.start_timeout,
                });
            }
            match self.inner.http.head(&url).send().await {
                Ok(response)
                    if response.status().as_u16() == 200 || response.status().as_u16() == 404 =>
                {
                    return Ok(());
                }
                Ok(response) => {
                    debug!(project = project_id, status = %response.status(), "not ready yet");
                }
                Err(_) => {}
            }
            tokio::time::sleep(self.inner.config.readiness_interval).await;
        }
    }

    fn spawn_log_pump(
        &self,
        project_id: &str,
        stream: LogStream,
        source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let project_id = project_id.to_string();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(source).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(project = %project_id, ?stream, "{line}");
                let _ = events.send(InstanceEvent::Log {
                    project_id: project_id.clone(),
                    stream,
                    message: line,
                });
            }
        });
    }

    /// Owns the child handle; reaps the process on exit, releasing its port
    /// and record whether the exit was requested or a crash.
    fn spawn_reaper(&self, project_id: &str, mut child: Child, exit_tx: watch::Sender<bool>) {
        let project_id = project_id.to_string();
        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code());

            let previous = {
                let mut state = supervisor
                    .inner
                    .state
                    .lock()
                    .expect("supervisor state poisoned");
                state.instances.remove(&project_id).map(|record| {
                    state.ports.insert(record.port);
                    record.status
                })
            };

            match previous {
                Some(InstanceStatus::Stopping) => {
                    info!(project = %project_id, ?code, "bundler exited after stop")
                }
                Some(_) => {
                    warn!(project = %project_id, ?code, "bundler exited unexpectedly")
                }
                None => {}
            }

            supervisor.emit(InstanceEvent::Exited {
                project_id: project_id.clone(),
                code,
            });
            let _ = exit_tx.send(true);
        });
    }

    /// Gracefully stop an instance: SIGTERM, a grace period, then SIGKILL.
    /// A no-op when the project has no instance. An instance still starting
    /// is cancelled instead: the boot task owns the child and the port, so
    /// this waits for it to observe the cancellation and resolve the slot
    /// rather than pulling either out from under it.
    pub async fn stop(&self, project_id: &str) -> Result<()> {
        let (pid, mut exit_rx) = {
            let mut state = self.inner.state.lock().expect("supervisor state poisoned");
            match state.instances.get_mut(project_id) {
                None => return Ok(()),
                Some(record) => {
                    record.status = InstanceStatus::Stopping;
                    if record.pid.is_none() {
                        record.cancelled = true;
                    }
                    (record.pid, record.exit_rx.clone())
                }
            }
        };

        match pid {
            Some(pid) => {
                debug!(project = project_id, pid, "sending SIGTERM");
                send_signal(pid, libc::SIGTERM);
                let grace = self.inner.config.stop_grace;
                if tokio::time::timeout(grace, exit_rx.changed()).await.is_err() {
                    warn!(project = project_id, pid, "grace period expired, sending SIGKILL");
                    send_signal(pid, libc::SIGKILL);
                    let _ = tokio::time::timeout(grace, exit_rx.changed()).await;
                }
            }
            None => {
                debug!(project = project_id, "cancelling instance still starting");
                let deadline =
                    self.inner.config.start_timeout + self.inner.config.stop_grace;
                if tokio::time::timeout(deadline, exit_rx.changed()).await.is_err() {
                    warn!(
                        project = project_id,
                        "startup did not resolve within the stop deadline"
                    );
                }
            }
        }

        self.emit(InstanceEvent::Stopped {
            project_id: project_id.to_string(),
        });
        Ok(())
    }

    /// Refresh the idle clock. Safe when no such instance exists.
    pub fn mark_active(&self, project_id: &str) {
        let mut state = self.inner.state.lock().expect("supervisor state poisoned");
        if let Some(record) = state.instances.get_mut(project_id) {
            record.last_active = Instant::now();
        }
    }

    pub fn get_instance(&self, project_id: &str) -> Option<InstanceSnapshot> {
        let state = self.inner.state.lock().expect("supervisor state poisoned");
        state
            .instances
            .get(project_id)
            .map(|record| record.snapshot(project_id))
    }

    pub fn get_all(&self) -> Vec<InstanceSnapshot> {
        let state = self.inner.state.lock().expect("supervisor state poisoned");
        state
            .instances
            .iter()
            .map(|(id, record)| record.snapshot(id))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.get_all()
            .iter()
            .filter(|s| s.status == InstanceStatus::Running)
            .count()
    }

    pub fn available_ports(&self) -> usize {
        let state = self.inner.state.lock().expect("supervisor state poisoned");
        state.ports.len()
    }

    pub fn preview_url(&self, project_id: &str) -> Option<String> {
        self.get_instance(project_id)?;
        let scheme = if self.inner.public.https { "https" } else { "http" };
        Some(format!(
            "{scheme}://{}/p/{project_id}/",
            self.public_authority()
        ))
    }

    pub fn hmr_url(&self, project_id: &str) -> Option<String> {
        self.get_instance(project_id)?;
        Some(format!(
            "{}://{}{}/{project_id}",
            self.inner.public.ws_protocol(),
            self.public_authority(),
            self.inner.hmr_path
        ))
    }

    fn public_authority(&self) -> String {
        let public = &self.inner.public;
        if public.client_port() == if public.https { 443 } else { 80 } {
            public.host.clone()
        } else {
            format!("{}:{}", public.host, public.client_port())
        }
    }

    /// Stop everything concurrently and cancel the idle sweeper.
    pub async fn destroy(&self) {
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .expect("sweeper slot poisoned")
            .take()
        {
            handle.abort();
        }
        let ids: Vec<String> = {
            let state = self.inner.state.lock().expect("supervisor state poisoned");
            state.instances.keys().cloned().collect()
        };
        let stops = ids.iter().map(|id| self.stop(id));
        futures_util::future::join_all(stops).await;
    }

    async fn sweep_idle(&self) {
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let idle_timeout = self.inner.config.idle_timeout;
            let stale: Vec<String> = {
                let state = self.inner.state.lock().expect("supervisor state poisoned");
                state
                    .instances
                    .iter()
                    .filter(|(_, record)| {
                        record.status == InstanceStatus::Running
                            && record.last_active.elapsed() > idle_timeout
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for project_id in stale {
                info!(project = %project_id, "stopping idle instance");
                let _ = self.stop(&project_id).await;
            }
        }
    }

    /// Make sure the project can actually run under the proxy: the tagging
    /// plugin must be installed and the bundler config must carry the right
    /// base, HMR and plugin wiring.
    async fn preflight(&self, project_id: &str, dir: &Path) -> Result<()> {
        self.ensure_tagger_dependency(dir).await?;
        self.ensure_vite_config(project_id, dir).await
    }

    async fn ensure_tagger_dependency(&self, dir: &Path) -> Result<()> {
        let manifest_path = dir.join("package.json");
        let Ok(raw) = tokio::fs::read_to_string(&manifest_path).await else {
            return Ok(());
        };
        let Ok(mut manifest) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return Ok(());
        };

        let listed = ["dependencies", "devDependencies"].iter().any(|section| {
            manifest
                .get(section)
                .and_then(|deps| deps.get(TAGGER_PACKAGE))
                .is_some()
        });
        if listed {
            return Ok(());
        }

        info!(dir = %dir.display(), "adding missing tagger dependency");
        if !manifest
            .get("devDependencies")
            .is_some_and(|v| v.is_object())
        {
            manifest["devDependencies"] = serde_json::json!({});
        }
        manifest["devDependencies"][TAGGER_PACKAGE] =
            serde_json::Value::String(self.inner.tagger_dep.clone());

        let mut out = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::Internal(format!("failed to serialise manifest: {e}")))?;
        out.push('\n');
        tokio::fs::write(&manifest_path, out).await?;

        let result = self.inner.deps.reinstall(dir).await;
        if !result.success {
            return Err(Error::InstallFailure(
                result.logs.last().cloned().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn ensure_vite_config(&self, project_id: &str, dir: &Path) -> Result<()> {
        let config_path = dir.join("vite.config.ts");
        let current = tokio::fs::read_to_string(&config_path)
            .await
            .unwrap_or_default();

        let base_ok = current.contains(&format!("base: \"/p/{project_id}/\""))
            || current.contains(&format!("base: '/p/{project_id}/'"));
        let hmr_ok = current.contains("hmr:");
        let tagger_ok = current.contains("jsxTagger") || current.contains(TAGGER_PACKAGE);
        if base_ok && hmr_ok && tagger_ok {
            return Ok(());
        }

        info!(project = project_id, "regenerating bundler config");
        let extras = scaffold::extract_extras(&current);
        let fresh = scaffold::generate_vite_config(
            project_id,
            &self.inner.public,
            &self.inner.hmr_path,
            &extras,
        );
        tokio::fs::write(&config_path, fresh).await?;
        Ok(())
    }

    fn release_slot(&self, project_id: &str) {
        let mut state = self.inner.state.lock().expect("supervisor state poisoned");
        if let Some(record) = state.instances.remove(project_id) {
            state.ports.insert(record.port);
        }
    }

    fn emit(&self, event: InstanceEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}
