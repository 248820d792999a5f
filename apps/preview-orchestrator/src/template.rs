use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PublicEndpoint;
use crate::deps::DependencyManager;
use crate::error::{Error, Result};
use crate::scaffold::{self, ScaffoldConfig, ViteConfigExtras};

type InitTask = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Builds the template project once (scaffold + install) and clones it for
/// each new project, skipping the dependency-install cost on creation.
///
/// The template directory is written exactly once and treated as read-only
/// afterwards; concurrent initialisers share a single in-flight job.
#[derive(Clone)]
pub struct TemplateManager {
    template_dir: PathBuf,
    prebuilt_dir: PathBuf,
    tagger_dep: String,
    public: PublicEndpoint,
    hmr_path: String,
    deps: Arc<DependencyManager>,
    ready: Arc<AtomicBool>,
    init: Arc<Mutex<Option<InitTask>>>,
}

impl TemplateManager {
    pub fn new(
        template_dir: PathBuf,
        prebuilt_dir: PathBuf,
        tagger_dep: String,
        public: PublicEndpoint,
        hmr_path: String,
        deps: Arc<DependencyManager>,
    ) -> Self {
        Self {
            template_dir,
            prebuilt_dir,
            tagger_dep,
            public,
            hmr_path,
            deps,
            ready: Arc::new(AtomicBool::new(false)),
            init: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &'static str {
        if self.is_ready() {
            "ready"
        } else if self.init.lock().expect("init slot poisoned").is_some() {
            "initialising"
        } else {
            "not-initialised"
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Idempotent: concurrent callers join the same in-flight job; a failed
    /// attempt can be retried.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let task = {
            let mut slot = self.init.lock().expect("init slot poisoned");
            match slot.as_ref() {
                Some(task) => task.clone(),
                None => {
                    let task = Self::init_task(
                        self.template_dir.clone(),
                        self.prebuilt_dir.clone(),
                        self.tagger_dep.clone(),
                        self.public.clone(),
                        self.hmr_path.clone(),
                        self.deps.clone(),
                        self.ready.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(task.clone());
                    task
                }
            }
        };

        let result = task.clone().await;

        let mut slot = self.init.lock().expect("init slot poisoned");
        if let Some(current) = slot.as_ref() {
            if InitTask::ptr_eq(current, &task) {
                *slot = None;
            }
        }

        result.map_err(Error::Internal)
    }

    async fn init_task(
        template_dir: PathBuf,
        prebuilt_dir: PathBuf,
        tagger_dep: String,
        public: PublicEndpoint,
        hmr_path: String,
        deps: Arc<DependencyManager>,
        ready: Arc<AtomicBool>,
    ) -> std::result::Result<(), String> {
        // Fast path 1: a populated template survived a restart.
        if template_dir.join("node_modules").is_dir() {
            info!(dir = %template_dir.display(), "template already populated");
            ready.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Fast path 2: a build-time pre-warmed template.
        if prebuilt_dir.join("node_modules").is_dir() {
            info!(
                from = %prebuilt_dir.display(),
                to = %template_dir.display(),
                "copying pre-warmed template"
            );
            if let Some(parent) = template_dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("failed to create data root: {e}"))?;
            }
            copy_dir(&prebuilt_dir, &template_dir).await?;
            ready.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Slow path: scaffold and install from scratch.
        info!(dir = %template_dir.display(), "building template (scaffold + install)");
        let result = Self::build_template(
            &template_dir,
            &tagger_dep,
            &public,
            &hmr_path,
            deps.as_ref(),
        )
        .await;

        if let Err(err) = result {
            warn!(dir = %template_dir.display(), error = %err, "template build failed; cleaning up");
            let _ = tokio::fs::remove_dir_all(&template_dir).await;
            return Err(err);
        }

        ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn build_template(
        template_dir: &Path,
        tagger_dep: &str,
        public: &PublicEndpoint,
        hmr_path: &str,
        deps: &DependencyManager,
    ) -> std::result::Result<(), String> {
        let files = scaffold::scaffold(&ScaffoldConfig {
            project_id: "template",
            project_name: "Template",
            description: None,
            tagger_dep,
            public,
            hmr_path,
        });

        for file in files {
            let path = template_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
            }
            tokio::fs::write(&path, file.content)
                .await
                .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        }

        let install = deps.ensure(template_dir).await;
        if !install.success {
            let tail = install
                .logs
                .iter()
                .rev()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(format!("template install failed: {tail}"));
        }

        info!(duration_ms = install.duration_ms, "template ready");
        Ok(())
    }

    /// Clone the template into `dest` and regenerate its bundler config for
    /// this project.
    pub async fn create_from_template(&self, project_id: &str, dest: &Path) -> Result<()> {
        // The template may have been wiped under us (volume reset). Detect
        // and rebuild rather than cloning a hole.
        if !self.template_dir.join("package.json").exists() {
            self.ready.store(false, Ordering::SeqCst);
        }
        if !self.is_ready() {
            self.initialize().await?;
        }

        // A retried create may leave a stale destination behind.
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        copy_dir(&self.template_dir, dest)
            .await
            .map_err(Error::Internal)?;

        let vite = scaffold::generate_vite_config(
            project_id,
            &self.public,
            &self.hmr_path,
            &ViteConfigExtras::default(),
        );
        tokio::fs::write(dest.join("vite.config.ts"), vite).await?;
        Ok(())
    }

    /// The template's package manifest, if the template has one.
    pub async fn manifest(&self) -> Option<serde_json::Value> {
        let raw = tokio::fs::read_to_string(self.template_dir.join("package.json"))
            .await
            .ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Recursive copy via `cp -R`: preserves the installed dependency tree
/// (symlinks included) far faster than a file-by-file walk.
pub async fn copy_dir(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    let status = Command::new("cp")
        .arg("-R")
        .arg(src)
        .arg(dst)
        .status()
        .await
        .map_err(|e| format!("failed to spawn cp: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!(
            "cp -R {} {} exited with {:?}",
            src.display(),
            dst.display(),
            status.code()
        ))
    }
}
