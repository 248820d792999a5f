use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of a package-manager invocation. Always a value: a failed
/// install is reported, never raised.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    pub duration_ms: u64,
    pub logs: Vec<String>,
}

impl InstallResult {
    fn skipped(reason: &str) -> Self {
        Self {
            success: true,
            duration_ms: 0,
            logs: vec![reason.to_string()],
        }
    }
}

type SharedInstall = Shared<BoxFuture<'static, InstallResult>>;

/// Wraps the external package manager. Installs are single-flighted per
/// directory: concurrent callers await the same spawned process and see the
/// same result.
pub struct DependencyManager {
    bun_binary: String,
    installing: Mutex<HashMap<PathBuf, SharedInstall>>,
}

impl DependencyManager {
    pub fn new(bun_binary: String) -> Self {
        Self {
            bun_binary,
            installing: Mutex::new(HashMap::new()),
        }
    }

    /// Install dependencies unless a `node_modules` tree is already there.
    pub async fn install(&self, dir: &Path) -> InstallResult {
        if dir.join("node_modules").is_dir() {
            debug!(dir = %dir.display(), "node_modules present, skipping install");
            return InstallResult::skipped("node_modules already present, skipping install");
        }
        self.run_install(dir).await
    }

    /// Run the package manager unconditionally, healing partial trees.
    pub async fn ensure(&self, dir: &Path) -> InstallResult {
        self.run_install(dir).await
    }

    /// Blow away `node_modules` and install from scratch.
    pub async fn reinstall(&self, dir: &Path) -> InstallResult {
        let node_modules = dir.join("node_modules");
        if node_modules.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(&node_modules).await {
                warn!(dir = %dir.display(), error = %err, "failed to remove node_modules");
                return InstallResult {
                    success: false,
                    duration_ms: 0,
                    logs: vec![format!("failed to remove node_modules: {err}")],
                };
            }
        }
        self.run_install(dir).await
    }

    pub async fn add(&self, dir: &Path, package: &str, dev: bool) -> InstallResult {
        let mut args = vec!["add"];
        if dev {
            args.push("--dev");
        }
        args.push(package);
        run_package_manager(&self.bun_binary, dir, &args).await
    }

    pub async fn remove(&self, dir: &Path, package: &str) -> InstallResult {
        run_package_manager(&self.bun_binary, dir, &["remove", package]).await
    }

    async fn run_install(&self, dir: &Path) -> InstallResult {
        let task = {
            let mut installing = self.installing.lock().expect("install map poisoned");
            match installing.get(dir) {
                Some(existing) => {
                    debug!(dir = %dir.display(), "joining in-flight install");
                    existing.clone()
                }
                None => {
                    let binary = self.bun_binary.clone();
                    let dir_owned = dir.to_path_buf();
                    let task = async move {
                        run_package_manager(&binary, &dir_owned, &["install"]).await
                    }
                    .boxed()
                    .shared();
                    installing.insert(dir.to_path_buf(), task.clone());
                    task
                }
            }
        };

        let result = task.clone().await;

        let mut installing = self.installing.lock().expect("install map poisoned");
        if let Some(current) = installing.get(dir) {
            // Only clear our own entry; a newer install may have replaced it.
            if Shared::ptr_eq(current, &task) {
                installing.remove(dir);
            }
        }
        result
    }
}

/// Spawn the package manager non-interactively in `dir` and capture its
/// output. Spawn errors and non-zero exits both land in the result's logs.
async fn run_package_manager(binary: &str, dir: &Path, args: &[&str]) -> InstallResult {
    let started = Instant::now();
    info!(binary, ?args, dir = %dir.display(), "running package manager");

    let output = Command::new(binary)
        .args(args)
        .current_dir(dir)
        .env("CI", "1")
        .env("NODE_ENV", "development")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match output {
        Ok(output) => {
            let mut logs: Vec<String> = Vec::new();
            logs.extend(lines_of(&output.stdout));
            logs.extend(lines_of(&output.stderr));
            let success = output.status.success();
            if !success {
                warn!(
                    binary,
                    ?args,
                    dir = %dir.display(),
                    code = ?output.status.code(),
                    "package manager exited non-zero"
                );
                logs.push(format!(
                    "{} {} exited with status {:?}",
                    binary,
                    args.join(" "),
                    output.status.code()
                ));
            }
            InstallResult {
                success,
                duration_ms,
                logs,
            }
        }
        Err(err) => {
            warn!(binary, error = %err, dir = %dir.display(), "failed to spawn package manager");
            InstallResult {
                success: false,
                duration_ms,
                logs: vec![format!("failed to spawn {binary}: {err}")],
            }
        }
    }
}

fn lines_of(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn install_skips_when_node_modules_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();

        // Binary that does not exist: if install actually ran it would fail.
        let manager = DependencyManager::new("/nonexistent-package-manager".to_string());
        let result = manager.install(dir.path()).await;
        assert!(result.success);
        assert_eq!(result.duration_ms, 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DependencyManager::new("/nonexistent-package-manager".to_string());
        let result = manager.ensure(dir.path()).await;
        assert!(!result.success);
        assert!(result.logs.iter().any(|l| l.contains("failed to spawn")));
    }

    #[tokio::test]
    async fn concurrent_installs_share_one_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");

        // A "package manager" that records every invocation.
        let script = dir.path().join("fake-pm.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho run >> \"$(pwd)/ran\"\nsleep 0.3\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let manager = Arc::new(DependencyManager::new(
            script.to_string_lossy().into_owned(),
        ));

        let a = {
            let m = manager.clone();
            let d = dir.path().to_path_buf();
            tokio::spawn(async move { m.ensure(&d).await })
        };
        let b = {
            let m = manager.clone();
            let d = dir.path().to_path_buf();
            tokio::spawn(async move { m.ensure(&d).await })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.success && rb.success);

        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 1, "install spawned more than once");
    }
}
