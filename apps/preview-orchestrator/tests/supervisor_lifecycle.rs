mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_fake_bundler, stub_bundler_binary};
use preview_orchestrator::config::{PublicEndpoint, SupervisorConfig};
use preview_orchestrator::deps::DependencyManager;
use preview_orchestrator::supervisor::{InstanceEvent, InstanceStatus, InstanceSupervisor};

fn make_supervisor(config: SupervisorConfig, bun_binary: String) -> InstanceSupervisor {
    let deps = Arc::new(DependencyManager::new(bun_binary.clone()));
    InstanceSupervisor::new(
        config,
        PublicEndpoint {
            host: "localhost".to_string(),
            https: false,
            port: 3000,
        },
        "/hmr".to_string(),
        "file:/app/packages/vite-plugin-jsx-tagger".to_string(),
        bun_binary,
        deps,
        reqwest::Client::new(),
    )
}

fn quick_config(base_port: u16, max: usize) -> SupervisorConfig {
    SupervisorConfig {
        base_port,
        max_instances: max,
        start_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_secs(2),
        readiness_interval: Duration::from_millis(50),
        ..SupervisorConfig::default()
    }
}

#[tokio::test]
async fn start_stop_lifecycle_conserves_ports_and_emits_events() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    let bundler_port = spawn_fake_bundler().await;
    let supervisor = make_supervisor(quick_config(bundler_port, 1), bun);
    let mut events = supervisor.subscribe();

    let project_dir = root.path().join("p1");
    std::fs::create_dir_all(&project_dir).unwrap();

    let instance = supervisor.start("p1", &project_dir).await.unwrap();
    assert_eq!(instance.port, bundler_port);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(supervisor.available_ports(), 0);
    assert_eq!(supervisor.running_count(), 1);

    // Idempotent: a second start returns the same live instance.
    let again = supervisor.start("p1", &project_dir).await.unwrap();
    assert_eq!(again.port, instance.port);

    // The pre-flight regenerated a conforming bundler config.
    let vite = std::fs::read_to_string(project_dir.join("vite.config.ts")).unwrap();
    assert!(vite.contains("base: \"/p/p1/\""));

    assert!(supervisor.preview_url("p1").unwrap().contains("/p/p1/"));
    assert!(supervisor.hmr_url("p1").unwrap().contains("/hmr/p1"));

    supervisor.stop("p1").await.unwrap();
    assert!(supervisor.get_instance("p1").is_none());
    assert_eq!(supervisor.available_ports(), 1);

    let mut saw_started = false;
    let mut saw_exited = false;
    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            InstanceEvent::Started { ref project_id, port } => {
                assert_eq!(project_id, "p1");
                assert_eq!(port, bundler_port);
                saw_started = true;
            }
            InstanceEvent::Exited { .. } => saw_exited = true,
            InstanceEvent::Stopped { .. } => saw_stopped = true,
            InstanceEvent::Log { .. } => {}
        }
    }
    assert!(saw_started && saw_exited && saw_stopped);
}

#[tokio::test]
async fn exhausted_pool_refuses_new_instances() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    let supervisor = make_supervisor(quick_config(5900, 0), bun);

    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();
    let err = supervisor.start("p1", &dir).await.unwrap_err();
    assert!(err.to_string().contains("no available ports"), "{err}");
    assert_eq!(supervisor.available_ports(), 0);
}

#[tokio::test]
async fn crash_during_startup_releases_the_port() {
    let root = tempfile::tempdir().unwrap();
    // A "bundler" that dies immediately.
    let script = root.path().join("crash-bun.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 7\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let supervisor = make_supervisor(
        quick_config(5901, 1),
        script.to_string_lossy().into_owned(),
    );
    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();

    let err = supervisor.start("p1", &dir).await.unwrap_err();
    assert!(err.to_string().contains("exited during startup"), "{err}");
    assert!(supervisor.get_instance("p1").is_none());
    assert_eq!(supervisor.available_ports(), 1);
}

#[tokio::test]
async fn spawn_failure_releases_the_port() {
    let root = tempfile::tempdir().unwrap();
    let supervisor =
        make_supervisor(quick_config(5902, 1), "/nonexistent-bundler-binary".to_string());
    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();

    let err = supervisor.start("p1", &dir).await.unwrap_err();
    assert!(err.to_string().contains("failed to spawn"), "{err}");
    assert_eq!(supervisor.available_ports(), 1);
}

#[tokio::test]
async fn stop_during_startup_waits_for_the_boot_to_resolve() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    // Nothing listens on this port, so readiness cannot succeed and the
    // instance sits in starting until cancelled or timed out.
    let config = SupervisorConfig {
        start_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_secs(1),
        readiness_interval: Duration::from_millis(50),
        ..quick_config(5903, 1)
    };
    let supervisor = make_supervisor(config, bun);
    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();

    let starter = {
        let supervisor = supervisor.clone();
        let dir = dir.clone();
        tokio::spawn(async move { supervisor.start("p1", &dir).await })
    };

    // Let the child spawn and enter the readiness poll.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.available_ports(), 0);
    assert_eq!(
        supervisor.get_instance("p1").unwrap().status,
        InstanceStatus::Starting
    );

    // The stop must not reclaim the port while the boot task still owns a
    // live child bound to it; it waits for the boot attempt to resolve.
    supervisor.stop("p1").await.unwrap();
    assert!(supervisor.get_instance("p1").is_none());
    assert_eq!(supervisor.available_ports(), 1);
    assert!(starter.await.unwrap().is_err());

    // The slot is genuinely reusable afterwards: a fresh start allocates
    // the port again and releases it when its own readiness poll fails.
    assert!(supervisor.start("p1", &dir).await.is_err());
    assert_eq!(supervisor.available_ports(), 1);
}

#[tokio::test]
async fn idle_instances_are_swept() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    let bundler_port = spawn_fake_bundler().await;
    let config = SupervisorConfig {
        idle_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..quick_config(bundler_port, 1)
    };
    let supervisor = make_supervisor(config, bun);

    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();
    supervisor.start("p1", &dir).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while supervisor.get_instance("p1").is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "idle instance was never evicted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(supervisor.available_ports(), 1);
}

#[tokio::test]
async fn mark_active_defers_eviction() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    let bundler_port = spawn_fake_bundler().await;
    let config = SupervisorConfig {
        idle_timeout: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(100),
        ..quick_config(bundler_port, 1)
    };
    let supervisor = make_supervisor(config, bun);

    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();
    supervisor.start("p1", &dir).await.unwrap();

    // Keep touching the instance well past the idle timeout.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        supervisor.mark_active("p1");
    }
    assert!(supervisor.get_instance("p1").is_some());

    supervisor.destroy().await;
    assert!(supervisor.get_instance("p1").is_none());
}

#[tokio::test]
async fn destroy_stops_everything() {
    let root = tempfile::tempdir().unwrap();
    let bun = stub_bundler_binary(root.path());
    let bundler_port = spawn_fake_bundler().await;
    let supervisor = make_supervisor(quick_config(bundler_port, 1), bun);

    let dir = root.path().join("p1");
    std::fs::create_dir_all(&dir).unwrap();
    supervisor.start("p1", &dir).await.unwrap();

    supervisor.destroy().await;
    assert_eq!(supervisor.running_count(), 0);
    assert_eq!(supervisor.available_ports(), 1);
}
