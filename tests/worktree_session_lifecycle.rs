use leitwerk::CoreConfig;
use leitwerk::domains::sessions::registry::SpawnRequest;
use leitwerk::domains::worktrees::ReservationState;
use leitwerk::orchestrator::Orchestrator;
use std::path::Path;
use tempfile::TempDir;

fn init_repo(dir: &Path) {
    let repo = git2::Repository::init(dir).unwrap();
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test").unwrap();
    cfg.set_str("user.email", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = repo.signature().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
}

fn ephemeral_config() -> CoreConfig {
    CoreConfig {
        hook_port: 0,
        termination_grace_ms: 3_000,
        ..CoreConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserve_spawn_kill_window_returns_tree_to_pool() {
    let _ = env_logger::builder().is_test(true).try_init();

    let repo_dir = TempDir::new().unwrap();
    init_repo(repo_dir.path());

    let orchestrator = Orchestrator::with_defaults(ephemeral_config());
    orchestrator.start().await.unwrap();

    // Reserve a worktree and bind a session to it.
    let reservation = orchestrator.pool().reserve(repo_dir.path()).await.unwrap();
    assert_eq!(reservation.state, ReservationState::CheckedOut);

    let session = orchestrator
        .registry()
        .spawn(SpawnRequest {
            window_id: "window-main".into(),
            command: "sh -c 'sleep 30'".into(),
            working_dir: repo_dir.path().to_path_buf(),
            reservation: Some(reservation.clone()),
        })
        .await
        .unwrap();
    assert_eq!(
        session.worktree_path.as_deref(),
        Some(reservation.worktree_path.as_path())
    );

    let live = orchestrator.registry().live_worktree_paths().await;
    assert!(live.contains(&reservation.worktree_path));

    // Closing the owning window terminates the session and returns the tree.
    orchestrator.registry().kill_by_owner("window-main").await;

    assert!(orchestrator.registry().snapshot().await.is_empty());
    let pool_state = orchestrator.pool().snapshot().await;
    assert_eq!(pool_state.len(), 1);
    assert_eq!(pool_state[0].state, ReservationState::Reserved);
    assert!(pool_state[0].owning_session_id.is_none());

    // The next reserve call reuses the tree instead of creating a new one.
    let reused = orchestrator.pool().reserve(repo_dir.path()).await.unwrap();
    assert_eq!(reused.worktree_path, reservation.worktree_path);

    let pool_dir = repo_dir
        .path()
        .join(leitwerk::domains::worktrees::POOL_DIR);
    assert_eq!(
        std::fs::read_dir(pool_dir).unwrap().count(),
        1,
        "reuse must not have created a second worktree"
    );

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orphan_cleanup_runs_as_background_task_and_spares_live_sessions() {
    let _ = env_logger::builder().is_test(true).try_init();

    let repo_dir = TempDir::new().unwrap();
    init_repo(repo_dir.path());

    let config = CoreConfig {
        hook_port: 0,
        orphan_age_minutes: 0,
        ..CoreConfig::default()
    };
    let orchestrator = Orchestrator::with_defaults(config);
    orchestrator.start().await.unwrap();

    // A live session bound to a reservation, plus a crash leftover the pool
    // knows nothing about.
    let reservation = orchestrator.pool().reserve(repo_dir.path()).await.unwrap();
    orchestrator
        .registry()
        .spawn(SpawnRequest {
            window_id: "window-main".into(),
            command: "sh -c 'sleep 30'".into(),
            working_dir: repo_dir.path().to_path_buf(),
            reservation: Some(reservation.clone()),
        })
        .await
        .unwrap();

    let orphan_path = repo_dir
        .path()
        .join(leitwerk::domains::worktrees::POOL_DIR)
        .join("wt-leftover");
    leitwerk::domains::worktrees::git::create_worktree_from_base(
        repo_dir.path(),
        "leitwerk/wt-leftover",
        &orphan_path,
        &leitwerk::domains::worktrees::git::current_branch(repo_dir.path()).unwrap(),
    )
    .unwrap();

    orchestrator.spawn_orphan_cleanup(repo_dir.path().to_path_buf());

    // The background task owns its own error boundary; poll for its result.
    for _ in 0..200 {
        if !orphan_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(!orphan_path.exists(), "leftover tree should be reclaimed");
    assert!(
        reservation.worktree_path.exists(),
        "live session's tree must survive the sweep"
    );

    orchestrator.shutdown().await;
}
