use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::PublicEndpoint;
use crate::deps::{DependencyManager, InstallResult};
use crate::error::{Error, Result};
use crate::scaffold::{self, ScaffoldConfig};
use crate::supervisor::{InstanceStatus, InstanceSupervisor};
use crate::template::TemplateManager;

/// Config files that user uploads may not overwrite when a project is
/// cloned from the template: replacing any of these would invalidate the
/// template's resolved dependency tree or its generated build config.
pub const CONFIG_SKIP_LIST: &[&str] = &[
    "package.json",
    "vite.config.ts",
    "vite.config.js",
    "bun.lockb",
    "bun.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "tailwind.config.js",
    "tailwind.config.ts",
    "tailwind.config.cjs",
    "postcss.config.js",
    "postcss.config.cjs",
    "postcss.config.mjs",
    "tsconfig.json",
    "tsconfig.node.json",
    "tsconfig.app.json",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    #[default]
    Update,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: Option<FileOperation>,
}

#[derive(Debug, Clone)]
pub struct CreateProject {
    pub project_id: String,
    pub project_name: String,
    pub description: Option<String>,
    pub files: Vec<ProjectFile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub dir: PathBuf,
    pub port: u16,
    pub preview_url: String,
    pub hmr_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub exists: bool,
    pub dev_server_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub file_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Owns on-disk project directories and orchestrates the template manager,
/// dependency helper and supervisor behind the control-plane operations.
pub struct ProjectManager {
    data_dir: PathBuf,
    deps: Arc<DependencyManager>,
    template: TemplateManager,
    supervisor: InstanceSupervisor,
    public: PublicEndpoint,
    hmr_path: String,
    tagger_dep: String,
}

impl ProjectManager {
    pub fn new(
        data_dir: PathBuf,
        deps: Arc<DependencyManager>,
        template: TemplateManager,
        supervisor: InstanceSupervisor,
        public: PublicEndpoint,
        hmr_path: String,
        tagger_dep: String,
    ) -> Self {
        Self {
            data_dir,
            deps,
            template,
            supervisor,
            public,
            hmr_path,
            tagger_dep,
        }
    }

    pub fn supervisor(&self) -> &InstanceSupervisor {
        &self.supervisor
    }

    pub fn template(&self) -> &TemplateManager {
        &self.template
    }

    /// Canonical on-disk location for a project id. The id is reduced to
    /// `[A-Za-z0-9_-]` before touching the filesystem, so traversal
    /// sequences cannot escape the data root.
    pub fn project_path(&self, project_id: &str) -> Result<PathBuf> {
        let id = sanitize_project_id(project_id)?;
        Ok(self.data_dir.join(id))
    }

    fn resolve(&self, project_id: &str) -> Result<(String, PathBuf)> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.data_dir.join(&id);
        Ok((id, dir))
    }

    /// Create a project and start its preview. Template fast path when the
    /// template is ready, scaffold + install otherwise.
    pub async fn create(&self, request: CreateProject) -> Result<PreviewInfo> {
        let (id, dir) = self.resolve(&request.project_id)?;
        tokio::fs::create_dir_all(&self.data_dir).await?;

        if self.template.is_ready() {
            info!(project = %id, "creating project from template");
            self.template.create_from_template(&id, &dir).await?;
            let user_manifest = write_user_files(&dir, &request.files).await?;
            if let Some(user_manifest) = user_manifest {
                merge_novel_dependencies(&dir, &user_manifest, self.deps.as_ref()).await?;
            }
        } else {
            info!(project = %id, "template not ready; scaffolding from scratch");
            let files = scaffold::scaffold(&ScaffoldConfig {
                project_id: &id,
                project_name: &request.project_name,
                description: request.description.as_deref(),
                tagger_dep: &self.tagger_dep,
                public: &self.public,
                hmr_path: &self.hmr_path,
            });
            for file in files {
                let path = safe_join(&dir, &file.path)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, file.content).await?;
            }
            write_user_files(&dir, &request.files).await?;

            let install = self.deps.install(&dir).await;
            if !install.success {
                return Err(Error::InstallFailure(
                    install.logs.last().cloned().unwrap_or_default(),
                ));
            }
        }

        self.start_preview(&id).await
    }

    pub async fn get_status(&self, project_id: &str) -> Result<ProjectStatus> {
        let (id, dir) = self.resolve(project_id)?;
        if !dir.exists() {
            return Ok(ProjectStatus {
                exists: false,
                dev_server_running: false,
                port: None,
                file_count: 0,
                last_modified: None,
            });
        }

        let instance = self.supervisor.get_instance(&id);
        let running = instance
            .as_ref()
            .is_some_and(|i| i.status == InstanceStatus::Running);
        let last_modified = tokio::fs::metadata(&dir)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Ok(ProjectStatus {
            exists: true,
            dev_server_running: running,
            port: instance.map(|i| i.port),
            file_count: walk_files(&dir).len(),
            last_modified,
        })
    }

    /// Apply a batch of file operations in order, then refresh the
    /// instance's idle clock so an active editing session is not evicted.
    pub async fn update_files(&self, project_id: &str, updates: &[FileUpdate]) -> Result<usize> {
        let (id, dir) = self.resolve(project_id)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }

        let mut applied = 0;
        for update in updates {
            let path = safe_join(&dir, &update.path)?;
            match update.operation.unwrap_or_default() {
                FileOperation::Create | FileOperation::Update => {
                    let Some(content) = update.content.as_deref() else {
                        return Err(Error::BadRequest(format!(
                            "content is required to write {}",
                            update.path
                        )));
                    };
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, content).await?;
                    applied += 1;
                }
                FileOperation::Delete => {
                    if path.exists() {
                        tokio::fs::remove_file(&path).await?;
                        applied += 1;
                    }
                }
            }
            debug!(project = %id, path = %update.path, "applied file update");
        }

        self.supervisor.mark_active(&id);
        Ok(applied)
    }

    /// Read one file; missing or unreadable files are `None`, not errors.
    pub async fn read_file(&self, project_id: &str, rel_path: &str) -> Result<Option<String>> {
        let (_, dir) = self.resolve(project_id)?;
        let path = safe_join(&dir, rel_path)?;
        Ok(tokio::fs::read_to_string(path).await.ok())
    }

    pub async fn list_files(&self, project_id: &str) -> Result<Vec<String>> {
        let (id, dir) = self.resolve(project_id)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }
        let mut files = walk_files(&dir);
        files.sort();
        Ok(files)
    }

    pub async fn start_preview(&self, project_id: &str) -> Result<PreviewInfo> {
        let (id, dir) = self.resolve(project_id)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }

        let install = self.deps.install(&dir).await;
        if !install.success {
            return Err(Error::InstallFailure(
                install.logs.last().cloned().unwrap_or_default(),
            ));
        }

        let instance = self.supervisor.start(&id, &dir).await?;
        Ok(PreviewInfo {
            dir,
            port: instance.port,
            preview_url: self.supervisor.preview_url(&id).unwrap_or_default(),
            hmr_url: self.supervisor.hmr_url(&id).unwrap_or_default(),
        })
    }

    pub async fn stop_preview(&self, project_id: &str) -> Result<()> {
        let (id, _) = self.resolve(project_id)?;
        self.supervisor.stop(&id).await
    }

    /// Stop the instance, then remove the project directory.
    pub async fn delete(&self, project_id: &str) -> Result<()> {
        let (id, dir) = self.resolve(project_id)?;
        self.supervisor.stop(&id).await?;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            info!(project = %id, "project deleted");
        }
        Ok(())
    }

    pub async fn reinstall_dependencies(&self, project_id: &str) -> Result<PreviewInfo> {
        let (id, dir) = self.resolve(project_id)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }

        self.supervisor.stop(&id).await?;
        let result = self.deps.reinstall(&dir).await;
        if !result.success {
            return Err(Error::InstallFailure(
                result.logs.last().cloned().unwrap_or_default(),
            ));
        }
        self.start_preview(&id).await
    }

    pub async fn add_dependency(
        &self,
        project_id: &str,
        package: &str,
        dev: bool,
    ) -> Result<InstallResult> {
        let (id, dir) = self.resolve(project_id)?;
        validate_package_name(package)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }
        Ok(self.deps.add(&dir, package, dev).await)
    }

    pub async fn remove_dependency(
        &self,
        project_id: &str,
        package: &str,
    ) -> Result<InstallResult> {
        let (id, dir) = self.resolve(project_id)?;
        validate_package_name(package)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!("project {id} does not exist")));
        }
        Ok(self.deps.remove(&dir, package).await)
    }

    /// How many project directories exist under the data root, the managed
    /// template excluded.
    pub async fn project_count(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.data_dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('_') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                count += 1;
            }
        }
        count
    }
}

/// Reduce a project id to `[A-Za-z0-9_-]`.
pub fn sanitize_project_id(project_id: &str) -> Result<String> {
    let cleaned: String = project_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return Err(Error::BadRequest(format!(
            "invalid project id: {project_id:?}"
        )));
    }
    Ok(cleaned)
}

/// Join a caller-supplied relative path under a project directory,
/// rejecting absolute paths and traversal components.
fn safe_join(dir: &Path, rel_path: &str) -> Result<PathBuf> {
    let rel = Path::new(rel_path);
    if rel.is_absolute() {
        return Err(Error::BadRequest(format!(
            "absolute paths are not allowed: {rel_path}"
        )));
    }
    for component in rel.components() {
        match component {
            std::path::Component::Normal(_) | std::path::Component::CurDir => {}
            _ => {
                return Err(Error::BadRequest(format!(
                    "path traversal is not allowed: {rel_path}"
                )))
            }
        }
    }
    Ok(dir.join(rel))
}

/// Write user files into a fresh clone, skipping the protected config set.
/// Returns the user's parsed `package.json` when one was supplied, so its
/// novel dependencies can be merged separately.
async fn write_user_files(
    dir: &Path,
    files: &[ProjectFile],
) -> Result<Option<serde_json::Value>> {
    let mut user_manifest = None;
    for file in files {
        let name = Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if CONFIG_SKIP_LIST.contains(&name.as_str()) {
            if name == "package.json" {
                user_manifest = serde_json::from_str(&file.content).ok();
            }
            debug!(path = %file.path, "skipping protected config file");
            continue;
        }

        let path = safe_join(dir, &file.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &file.content).await?;
    }
    Ok(user_manifest)
}

/// Merge dependencies the user's manifest lists but the template does not,
/// then install the delta.
async fn merge_novel_dependencies(
    dir: &Path,
    user_manifest: &serde_json::Value,
    deps: &DependencyManager,
) -> Result<()> {
    let manifest_path = dir.join("package.json");
    let raw = tokio::fs::read_to_string(&manifest_path).await?;
    let mut manifest: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| Error::Internal(format!("template manifest is not valid JSON: {e}")))?;

    let known: Vec<String> = ["dependencies", "devDependencies"]
        .iter()
        .filter_map(|section| manifest.get(*section))
        .filter_map(|deps| deps.as_object())
        .flat_map(|deps| deps.keys().cloned())
        .collect();

    let mut novel = 0;
    for section in ["dependencies", "devDependencies"] {
        let Some(requested) = user_manifest.get(section).and_then(|d| d.as_object()) else {
            continue;
        };
        for (package, version) in requested {
            if known.contains(package) {
                continue;
            }
            if !manifest.get(section).is_some_and(|v| v.is_object()) {
                manifest[section] = serde_json::json!({});
            }
            manifest[section][package.as_str()] = version.clone();
            novel += 1;
        }
    }

    if novel == 0 {
        return Ok(());
    }

    info!(count = novel, dir = %dir.display(), "installing user-requested dependencies");
    let mut out = serde_json::to_string_pretty(&manifest)
        .map_err(|e| Error::Internal(format!("failed to serialise manifest: {e}")))?;
    out.push('\n');
    tokio::fs::write(&manifest_path, out).await?;

    let result = deps.ensure(dir).await;
    if !result.success {
        return Err(Error::InstallFailure(
            result.logs.last().cloned().unwrap_or_default(),
        ));
    }
    Ok(())
}

fn validate_package_name(package: &str) -> Result<()> {
    let ok = !package.is_empty()
        && package.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '-' | '_' | '^' | '~')
        });
    if ok {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid package name: {package:?}")))
    }
}

/// All files under a project, `node_modules` and `.git` pruned, as
/// forward-slashed relative paths.
fn walk_files(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != "node_modules" && name != ".git"
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_project_id("../etc/passwd").unwrap(), "etcpasswd");
        assert_eq!(sanitize_project_id("p1").unwrap(), "p1");
        assert_eq!(
            sanitize_project_id("a1b2c3d4-e5f6-7890").unwrap(),
            "a1b2c3d4-e5f6-7890"
        );
        assert!(sanitize_project_id("../..").is_err());
        assert!(sanitize_project_id("").is_err());
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let base = Path::new("/data/sites/p1");
        assert!(safe_join(base, "src/App.tsx").is_ok());
        assert!(safe_join(base, "./src/App.tsx").is_ok());
        assert!(safe_join(base, "../other/file").is_err());
        assert!(safe_join(base, "src/../../escape").is_err());
        assert!(safe_join(base, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn user_files_respect_the_skip_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"template","dependencies":{"react":"^18.3.0"}}"#,
        )
        .unwrap();

        let files = vec![
            ProjectFile {
                path: "package.json".into(),
                content: r#"{"name":"mine","dependencies":{"zustand":"^4.5.0"}}"#.into(),
            },
            ProjectFile {
                path: "vite.config.ts".into(),
                content: "export default {};".into(),
            },
            ProjectFile {
                path: "src/App.tsx".into(),
                content: "export default () => <div/>;".into(),
            },
        ];

        let manifest = write_user_files(dir.path(), &files).await.unwrap();

        // The template manifest survives; the user's is only parsed.
        let on_disk = std::fs::read_to_string(dir.path().join("package.json")).unwrap();
        assert!(on_disk.contains("\"template\""));
        assert!(!dir.path().join("vite.config.ts").exists());
        assert!(dir.path().join("src/App.tsx").exists());
        assert_eq!(manifest.unwrap()["name"], "mine");
    }

    #[tokio::test]
    async fn novel_dependencies_are_merged_into_the_template_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"template","dependencies":{"react":"^18.3.0"}}"#,
        )
        .unwrap();

        // Package manager stub that records whether it ran.
        let script = dir.path().join("fake-pm.sh");
        std::fs::write(&script, "#!/bin/sh\ntouch ensured\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let deps = DependencyManager::new(script.to_string_lossy().into_owned());

        let user: serde_json::Value = serde_json::from_str(
            r#"{"dependencies":{"react":"^17.0.0","zustand":"^4.5.0"}}"#,
        )
        .unwrap();
        merge_novel_dependencies(dir.path(), &user, &deps).await.unwrap();

        let merged: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("package.json")).unwrap())
                .unwrap();
        // The template's react pin wins; only the novel package is added.
        assert_eq!(merged["dependencies"]["react"], "^18.3.0");
        assert_eq!(merged["dependencies"]["zustand"], "^4.5.0");
        assert!(dir.path().join("ensured").exists());
    }

    #[tokio::test]
    async fn merge_without_novel_packages_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies":{"react":"^18.3.0"}}"#,
        )
        .unwrap();
        let deps = DependencyManager::new("/nonexistent-pm".to_string());

        let user: serde_json::Value =
            serde_json::from_str(r#"{"dependencies":{"react":"^17.0.0"}}"#).unwrap();
        // Would fail if it tried to spawn the nonexistent package manager.
        merge_novel_dependencies(dir.path(), &user, &deps).await.unwrap();
    }

    #[test]
    fn walk_prunes_dependency_trees() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/App.tsx"), "x").unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "x").unwrap();
        std::fs::write(dir.path().join("index.html"), "x").unwrap();

        let mut files = walk_files(dir.path());
        files.sort();
        assert_eq!(files, vec!["index.html", "src/App.tsx"]);
    }
}
