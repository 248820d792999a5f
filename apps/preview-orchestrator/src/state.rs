use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::deps::DependencyManager;
use crate::hmr::HmrSplicer;
use crate::projects::ProjectManager;
use crate::supervisor::InstanceSupervisor;
use crate::template::TemplateManager;

/// Shared application state cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supervisor: InstanceSupervisor,
    pub projects: Arc<ProjectManager>,
    pub splicer: Arc<HmrSplicer>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        // The proxy must relay redirects verbatim rather than follow them.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build HTTP client");

        let deps = Arc::new(DependencyManager::new(config.bun_binary.clone()));

        let template = TemplateManager::new(
            config.template_dir(),
            config.prebuilt_template_dir.clone(),
            config.jsx_tagger_dep.clone(),
            config.public.clone(),
            config.hmr_path.clone(),
            deps.clone(),
        );

        let supervisor = InstanceSupervisor::new(
            config.supervisor.clone(),
            config.public.clone(),
            config.hmr_path.clone(),
            config.jsx_tagger_dep.clone(),
            config.bun_binary.clone(),
            deps.clone(),
            http.clone(),
        );

        let projects = Arc::new(ProjectManager::new(
            config.data_dir.clone(),
            deps,
            template,
            supervisor.clone(),
            config.public.clone(),
            config.hmr_path.clone(),
            config.jsx_tagger_dep.clone(),
        ));

        let splicer = Arc::new(HmrSplicer::new(supervisor.clone()));

        Self {
            config: Arc::new(config),
            supervisor,
            projects,
            splicer,
            http,
            started_at: Instant::now(),
        }
    }
}
