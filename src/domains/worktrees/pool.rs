use super::entity::{ReservationState, WorktreeReservation};
use super::git;
use crate::config::CoreConfig;
use crate::errors::CoreError;
use crate::infrastructure::events::{CoreEvent, EventEmitter, emit_event};
use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

pub const POOL_DIR: &str = ".leitwerk/worktrees";
const BRANCH_NAMESPACE: &str = "leitwerk";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeEventPayload {
    pub reservation_id: String,
    pub repository: String,
    pub worktree_path: String,
    pub branch: String,
}

impl WorktreeEventPayload {
    fn from_reservation(reservation: &WorktreeReservation) -> Self {
        Self {
            reservation_id: reservation.id.clone(),
            repository: reservation.repository_path.display().to_string(),
            worktree_path: reservation.worktree_path.display().to_string(),
            branch: reservation.branch.clone(),
        }
    }
}

/// Orphans predate the pool's bookkeeping, so there is no reservation id to
/// report; the path is the identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeReclaimedPayload {
    pub repository: String,
    pub worktree_path: String,
}

#[derive(Default)]
struct RepoPool {
    idle: Vec<WorktreeReservation>,
    checked_out: HashMap<String, WorktreeReservation>,
}

impl RepoPool {
    fn tracks_path(&self, canonical: &Path) -> bool {
        self.idle
            .iter()
            .chain(self.checked_out.values())
            .any(|r| canonicalize_lossy(&r.worktree_path) == canonical)
    }
}

/// Manages reservation and release of isolated git worktrees, one pool per
/// repository. All mutating operations for a repository serialize behind
/// that repository's lock; different repositories proceed independently.
pub struct WorktreePool {
    config: Arc<CoreConfig>,
    emitter: Arc<dyn EventEmitter>,
    pools: DashMap<PathBuf, Arc<Mutex<RepoPool>>>,
    repo_of_reservation: DashMap<String, PathBuf>,
}

impl WorktreePool {
    pub fn new(config: Arc<CoreConfig>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            config,
            emitter,
            pools: DashMap::new(),
            repo_of_reservation: DashMap::new(),
        }
    }

    fn repo_pool(&self, canonical_repo: &Path) -> Arc<Mutex<RepoPool>> {
        self.pools
            .entry(canonical_repo.to_path_buf())
            .or_default()
            .clone()
    }

    /// Hand out an idle reserved tree for the repository, or create a fresh
    /// branch and worktree when none is available. The returned reservation
    /// is `CheckedOut` and must be released when its session ends.
    pub async fn reserve(&self, repository: &Path) -> Result<WorktreeReservation, CoreError> {
        let repo = canonicalize_repo(repository)?;

        let valid = {
            let probe = repo.clone();
            tokio::task::spawn_blocking(move || git::is_git_repository(&probe))
                .await
                .unwrap_or(false)
        };
        if !valid {
            return Err(CoreError::reservation(
                repository.display(),
                "not a git repository",
            ));
        }

        let pool = self.repo_pool(&repo);
        let mut pool = pool.lock().await;

        if let Some(mut reservation) = pool.idle.pop() {
            reservation.state = ReservationState::CheckedOut;
            info!(
                "Reusing reserved worktree {} for {}",
                reservation.worktree_path.display(),
                repo.display()
            );
            pool.checked_out
                .insert(reservation.id.clone(), reservation.clone());
            self.emit_worktree_event(CoreEvent::WorktreeReserved, &reservation);
            return Ok(reservation);
        }

        let reservation = self.create_reservation(&repo).await?;
        pool.checked_out
            .insert(reservation.id.clone(), reservation.clone());
        self.repo_of_reservation
            .insert(reservation.id.clone(), repo.clone());
        self.emit_worktree_event(CoreEvent::WorktreeReserved, &reservation);
        Ok(reservation)
    }

    async fn create_reservation(&self, repo: &Path) -> Result<WorktreeReservation, CoreError> {
        let fragment = Uuid::new_v4().simple().to_string();
        let name = format!("wt-{}", &fragment[..8]);
        let branch = format!("{BRANCH_NAMESPACE}/{name}");
        let worktree_path = repo.join(POOL_DIR).join(&name);

        let base_branch = {
            let repo_buf = repo.to_path_buf();
            tokio::task::spawn_blocking(move || git::current_branch(&repo_buf))
                .await
                .map_err(|e| CoreError::reservation(repo.display(), e))?
                .map_err(|e| CoreError::reservation(repo.display(), e))?
        };

        {
            let repo_buf = repo.to_path_buf();
            let branch = branch.clone();
            let worktree_path = worktree_path.clone();
            let base = base_branch.clone();
            tokio::task::spawn_blocking(move || {
                git::create_worktree_from_base(&repo_buf, &branch, &worktree_path, &base)
            })
            .await
            .map_err(|e| CoreError::reservation(repo.display(), e))?
            .map_err(|e| CoreError::reservation(repo.display(), e))?;
        }

        Ok(WorktreeReservation {
            id: Uuid::new_v4().to_string(),
            repository_path: repo.to_path_buf(),
            worktree_path,
            branch,
            base_branch,
            state: ReservationState::CheckedOut,
            owning_session_id: None,
            reserved_at: Utc::now(),
        })
    }

    /// Record which session a checked-out reservation belongs to.
    pub async fn bind_session(
        &self,
        reservation_id: &str,
        session_id: &str,
    ) -> Result<(), CoreError> {
        let repo = self.lookup_repo(reservation_id)?;
        let pool = self.repo_pool(&repo);
        let mut pool = pool.lock().await;

        match pool.checked_out.get_mut(reservation_id) {
            Some(reservation) => {
                reservation.owning_session_id = Some(session_id.to_string());
                Ok(())
            }
            None => Err(CoreError::invalid_input(
                "reservation_id",
                format!("reservation '{reservation_id}' is not checked out"),
            )),
        }
    }

    /// Return a tree to the `Reserved` pool for reuse. Best-effort: a tree
    /// that cannot be reset cleanly is deleted instead of being recycled.
    pub async fn release(&self, reservation_id: &str) {
        let Ok(repo) = self.lookup_repo(reservation_id) else {
            warn!("Release for unknown reservation '{reservation_id}', ignoring");
            return;
        };

        let pool = self.repo_pool(&repo);
        let mut pool = pool.lock().await;

        let Some(mut reservation) = pool.checked_out.remove(reservation_id) else {
            warn!("Reservation '{reservation_id}' was not checked out, ignoring release");
            return;
        };

        reservation.owning_session_id = None;

        let reset_ok = {
            let worktree = reservation.worktree_path.clone();
            let base = reservation.base_branch.clone();
            let budget = self.config.cleanup_item_timeout();
            matches!(
                timeout(
                    budget,
                    tokio::task::spawn_blocking(move || git::reset_worktree_to_base(&worktree, &base)),
                )
                .await,
                Ok(Ok(Ok(())))
            )
        };

        if reset_ok {
            reservation.state = ReservationState::Reserved;
            info!(
                "Returned worktree {} to the pool",
                reservation.worktree_path.display()
            );
            self.emit_worktree_event(CoreEvent::WorktreeReleased, &reservation);
            pool.idle.push(reservation);
        } else {
            warn!(
                "Could not reset {}; deleting instead of recycling",
                reservation.worktree_path.display()
            );
            reservation.state = ReservationState::Released;
            self.delete_reservation(&repo, &reservation).await;
            self.repo_of_reservation.remove(reservation_id);
            self.emit_worktree_event(CoreEvent::WorktreeReleased, &reservation);
        }
    }

    /// Drop idle trees beyond the configured pool ceiling, oldest first.
    /// Run as a low-priority background task.
    pub async fn trim_idle(&self, repository: &Path) {
        let Ok(repo) = canonicalize_repo(repository) else {
            return;
        };
        let pool = self.repo_pool(&repo);
        let mut pool = pool.lock().await;

        while pool.idle.len() > self.config.pool_ceiling {
            // Oldest reservation sits at the front; `release` pushes to the back.
            let reservation = pool.idle.remove(0);
            info!(
                "Trimming idle worktree {} beyond pool ceiling",
                reservation.worktree_path.display()
            );
            self.delete_reservation(&repo, &reservation).await;
            self.repo_of_reservation.remove(&reservation.id);
        }
    }

    /// Reclaim on-disk worktrees that no live session owns and that exceed
    /// the orphan age threshold. Idempotent; safe to run concurrently with
    /// reservation traffic because it serializes on the repository lock.
    /// Returns the number of trees reclaimed.
    pub async fn cleanup_orphaned_reserves(
        &self,
        repository: &Path,
        live_paths: &HashSet<PathBuf>,
    ) -> Result<usize, CoreError> {
        let repo = canonicalize_repo(repository)?;
        let pool = self.repo_pool(&repo);
        let pool = pool.lock().await;

        {
            let repo = repo.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || git::prune_stale_worktrees(&repo)).await
            {
                warn!("Stale worktree prune task failed: {e}");
            }
        }

        let listed = {
            let repo = repo.clone();
            tokio::task::spawn_blocking(move || git::list_linked_worktrees(&repo))
                .await
                .map_err(|e| CoreError::git("list_worktrees", e))?
                .map_err(|e| CoreError::git("list_worktrees", e))?
        };

        let live: HashSet<PathBuf> = live_paths.iter().map(|p| canonicalize_lossy(p)).collect();
        let mut reclaimed = 0;

        for worktree_path in listed {
            if !worktree_path
                .to_string_lossy()
                .contains(&format!("/{POOL_DIR}/"))
            {
                continue;
            }

            let canonical = canonicalize_lossy(&worktree_path);
            if live.contains(&canonical) || pool.tracks_path(&canonical) {
                continue;
            }

            if !self.exceeds_orphan_age(&worktree_path) {
                continue;
            }

            info!("Reclaiming orphaned worktree: {}", worktree_path.display());
            let removed = {
                let repo = repo.clone();
                let path = worktree_path.clone();
                let budget = self.config.cleanup_item_timeout();
                timeout(
                    budget,
                    tokio::task::spawn_blocking(move || git::remove_worktree(&repo, &path)),
                )
                .await
            };

            match removed {
                Ok(Ok(Ok(()))) => {
                    self.prune_reservation_branch(&repo, &worktree_path).await;
                    let payload = WorktreeReclaimedPayload {
                        repository: repo.display().to_string(),
                        worktree_path: worktree_path.display().to_string(),
                    };
                    let _ = emit_event(&*self.emitter, CoreEvent::WorktreeReclaimed, &payload);
                    reclaimed += 1;
                }
                Ok(Ok(Err(e))) => {
                    warn!(
                        "Skipping orphan {}: removal failed: {e}",
                        worktree_path.display()
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        "Skipping orphan {}: removal task failed: {e}",
                        worktree_path.display()
                    );
                }
                Err(_) => {
                    warn!(
                        "Skipping orphan {}: removal exceeded per-item budget",
                        worktree_path.display()
                    );
                }
            }
        }

        Ok(reclaimed)
    }

    pub async fn snapshot(&self) -> Vec<WorktreeReservation> {
        let mut reservations = Vec::new();
        for entry in self.pools.iter() {
            let pool = entry.value().lock().await;
            reservations.extend(pool.idle.iter().cloned());
            reservations.extend(pool.checked_out.values().cloned());
        }
        reservations
    }

    fn lookup_repo(&self, reservation_id: &str) -> Result<PathBuf, CoreError> {
        self.repo_of_reservation
            .get(reservation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CoreError::invalid_input(
                    "reservation_id",
                    format!("unknown reservation '{reservation_id}'"),
                )
            })
    }

    fn exceeds_orphan_age(&self, path: &Path) -> bool {
        let threshold_secs = self.config.orphan_age_minutes.max(0) as u64 * 60;
        let modified = std::fs::metadata(path).and_then(|m| m.modified());
        match modified {
            Ok(mtime) => SystemTime::now()
                .duration_since(mtime)
                .map(|age| age.as_secs() >= threshold_secs)
                .unwrap_or(false),
            // Unreadable metadata: treat as old enough, the tree is junk.
            Err(_) => true,
        }
    }

    async fn delete_reservation(&self, repo: &Path, reservation: &WorktreeReservation) {
        let remove = {
            let repo = repo.to_path_buf();
            let path = reservation.worktree_path.clone();
            tokio::task::spawn_blocking(move || git::remove_worktree(&repo, &path)).await
        };
        match remove {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Failed to remove worktree {}: {e}",
                reservation.worktree_path.display()
            ),
            Err(e) => warn!("Worktree removal task failed: {e}"),
        }

        let branch = reservation.branch.clone();
        let repo = repo.to_path_buf();
        let delete = tokio::task::spawn_blocking(move || git::delete_branch(&repo, &branch)).await;
        if let Ok(Err(e)) = delete {
            warn!("Failed to delete branch {}: {e}", reservation.branch);
        }
    }

    async fn prune_reservation_branch(&self, repo: &Path, worktree_path: &Path) {
        let Some(name) = worktree_path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let branch = format!("{BRANCH_NAMESPACE}/{name}");
        let repo = repo.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || git::delete_branch(&repo, &branch)).await;
        if let Ok(Err(e)) = result {
            warn!("Orphan branch prune failed: {e}");
        }
    }

    fn emit_worktree_event(&self, event: CoreEvent, reservation: &WorktreeReservation) {
        let payload = WorktreeEventPayload::from_reservation(reservation);
        let _ = emit_event(&*self.emitter, event, &payload);
    }
}

fn canonicalize_repo(path: &Path) -> Result<PathBuf, CoreError> {
    path.canonicalize()
        .map_err(|e| CoreError::reservation(path.display(), e))
}

fn canonicalize_lossy(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
