//! Bootstrap and shutdown of the builtin pipelines and their collaborators.

use std::path::Path;
use std::time::Duration;

use sluice::config::AgentConfig;
use sluice::manager::PipelineManager;

fn manager_in(dir: &Path) -> PipelineManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = AgentConfig {
        checkpoint_dir: dir.to_path_buf(),
        force_self_collect: true,
        stop_timeout: Duration::from_secs(5),
    };
    PipelineManager::new(config, tokio::runtime::Handle::current())
}

#[tokio::test(flavor = "multi_thread")]
async fn init_loads_the_builtin_pipelines_and_the_checkpoint_store() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());
    manager.init().unwrap();
    assert!(manager.builtins_loaded());

    manager.checkpoints().put("input_file//var/log/app.log", "offset=7");
    manager.stop_builtin_modules().await;
    assert!(!manager.builtins_loaded());

    // the checkpoint collaborator is stopped last and persists its state
    assert!(dir.path().join("checkpoints.toml").exists());
    let reloaded = manager_in(dir.path());
    reloaded.init().unwrap();
    let cp = reloaded.checkpoints().get("input_file//var/log/app.log").unwrap();
    assert_eq!(cp.value, "offset=7");
}

#[tokio::test(flavor = "multi_thread")]
async fn a_second_builtin_shutdown_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());
    manager.init().unwrap();
    manager.stop_builtin_modules().await;
    manager.stop_builtin_modules().await;
    assert!(!manager.builtins_loaded());
}

#[tokio::test(flavor = "multi_thread")]
async fn init_fails_on_a_corrupt_checkpoint_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("checkpoints.toml"), "not [ valid toml").unwrap();
    let manager = manager_in(dir.path());
    assert!(manager.init().is_err());
    assert!(!manager.builtins_loaded());
}
