use anyhow::{Result, anyhow};
use git2::{
    BranchType, Repository, ResetType, WorktreeAddOptions, WorktreePruneOptions,
    build::CheckoutBuilder,
};
use log::{info, warn};
use std::path::{Path, PathBuf};

pub fn is_git_repository(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

pub fn current_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head()?;
    head.shorthand()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("HEAD is not a named branch"))
}

fn resolve_base_commit<'a>(repo: &'a Repository, base_branch: &str) -> Result<git2::Commit<'a>> {
    let candidates = [
        format!("refs/heads/{base_branch}"),
        format!("refs/remotes/origin/{base_branch}"),
    ];

    for reference_name in candidates {
        if let Ok(reference) = repo.find_reference(&reference_name)
            && let Ok(commit) = reference.peel_to_commit()
        {
            return Ok(commit);
        }
    }

    Err(anyhow!(
        "Base branch '{base_branch}' does not exist in the repository (tried local and origin)"
    ))
}

/// Create a new worktree on a fresh branch pointing at the base branch head.
/// An existing branch with the same name is deleted first; reservation branch
/// names are pool-owned, never user branches.
pub fn create_worktree_from_base(
    repo_path: &Path,
    branch_name: &str,
    worktree_path: &Path,
    base_branch: &str,
) -> Result<()> {
    validate_branch_name(branch_name)?;
    validate_branch_name(base_branch)?;

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repo = Repository::open(repo_path)?;
    let base_commit = resolve_base_commit(&repo, base_branch)?;

    if let Ok(mut branch) = repo.find_branch(branch_name, BranchType::Local) {
        info!("Deleting existing reservation branch: {branch_name}");
        branch.delete()?;
    }

    let new_branch = repo.branch(branch_name, &base_commit, false)?;
    let branch_ref = new_branch.into_reference();

    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));

    repo.worktree(
        worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch_name),
        worktree_path,
        Some(&opts),
    )?;

    info!(
        "Created worktree at {} from {base_branch}",
        worktree_path.display()
    );
    Ok(())
}

/// Remove a worktree directory and prune its git registration.
pub fn remove_worktree(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    let canonical_target = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            let wt_path = wt.path();
            let canonical_wt = wt_path
                .canonicalize()
                .unwrap_or_else(|_| wt_path.to_path_buf());
            if canonical_wt == canonical_target || wt_path == worktree_path {
                // Remove the directory first; pruning requires it gone.
                if worktree_path.exists()
                    && let Err(e) = std::fs::remove_dir_all(worktree_path)
                {
                    return Err(anyhow!("Failed to remove worktree directory: {e}"));
                }

                if let Err(e) = wt.prune(Some(&mut WorktreePruneOptions::new())) {
                    warn!("Failed to prune worktree from git registry: {e}");
                }
                return Ok(());
            }
        }
    }

    // Not registered with git; still clear the directory if present.
    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
        Ok(())
    } else {
        Err(anyhow!("Worktree not found: {worktree_path:?}"))
    }
}

/// Paths of all worktrees registered with the repository, main workdir
/// excluded.
pub fn list_linked_worktrees(repo_path: &Path) -> Result<Vec<PathBuf>> {
    let repo = Repository::open(repo_path)?;
    let mut paths = Vec::new();

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            paths.push(wt.path().to_path_buf());
        }
    }

    Ok(paths)
}

pub fn prune_stale_worktrees(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let worktrees = repo.worktrees()?;

    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name)
            && wt.validate().is_err()
        {
            wt.prune(Some(&mut WorktreePruneOptions::new()))?;
        }
    }

    Ok(())
}

pub fn delete_branch(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut branch = repo
        .find_branch(branch_name, BranchType::Local)
        .map_err(|e| anyhow!("Branch '{branch_name}' not found: {e}"))?;
    branch.delete()?;
    Ok(())
}

/// Hard-reset a worktree's branch to the base head and scrub untracked and
/// ignored files, leaving the tree as if freshly created from the base.
pub fn reset_worktree_to_base(worktree_path: &Path, base_branch: &str) -> Result<()> {
    let repo = Repository::open(worktree_path)?;

    if !repo.is_worktree() {
        return Err(anyhow!("Target repository is not a git worktree"));
    }

    validate_branch_name(base_branch)?;

    let base_ref_names = [
        format!("refs/heads/{base_branch}"),
        format!("refs/remotes/origin/{base_branch}"),
    ];

    let mut target_obj = None;
    for name in &base_ref_names {
        if let Ok(reference) = repo.find_reference(name)
            && let Some(oid) = reference.target()
        {
            target_obj = Some(repo.find_object(oid, None)?);
            break;
        }
    }

    let target_obj = target_obj.ok_or_else(|| {
        anyhow!("Base reference not found: {base_branch} (tried local and origin)")
    })?;

    repo.reset(&target_obj, ResetType::Hard, None)?;

    repo.checkout_head(Some(
        CheckoutBuilder::new()
            .force()
            .remove_untracked(true)
            .remove_ignored(true),
    ))?;

    Ok(())
}

pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("Branch name cannot be empty"));
    }
    if name.contains("..") || name.contains('\0') || name.contains('\\') {
        return Err(anyhow!("Invalid branch name"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.');
    if !name.chars().all(allowed) {
        return Err(anyhow!("Branch name contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut cfg = repo.config().unwrap();
            cfg.set_str("user.name", "Test").unwrap();
            cfg.set_str("user.email", "test@example.com").unwrap();
        }
        {
            let mut index = repo.index().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = repo.signature().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[test]
    fn branch_name_validation() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("leitwerk/wt-1a2b3c4d").is_ok());
        assert!(validate_branch_name("release-1.2.3").is_ok());
        assert!(validate_branch_name("..bad").is_err());
        assert!(validate_branch_name("bad\\name").is_err());
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn detects_git_repository() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_git_repository(tmp.path()));
        init_repo(tmp.path());
        assert!(is_git_repository(tmp.path()));
    }

    #[test]
    fn create_and_remove_worktree_round_trip() {
        let tmp = TempDir::new().unwrap();
        let repo = init_repo(tmp.path());
        let base = repo.head().unwrap().shorthand().unwrap().to_string();

        let wt_path = tmp.path().join(".leitwerk/worktrees/wt-roundtrip");
        create_worktree_from_base(tmp.path(), "leitwerk/wt-roundtrip", &wt_path, &base).unwrap();
        assert!(wt_path.exists());
        assert_eq!(list_linked_worktrees(tmp.path()).unwrap().len(), 1);

        remove_worktree(tmp.path(), &wt_path).unwrap();
        assert!(!wt_path.exists());
        assert!(list_linked_worktrees(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn create_worktree_fails_for_missing_base() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());

        let wt_path = tmp.path().join(".leitwerk/worktrees/wt-nobase");
        let result =
            create_worktree_from_base(tmp.path(), "leitwerk/wt-nobase", &wt_path, "no-such-base");
        assert!(result.is_err());
    }

    #[test]
    fn reset_scrubs_untracked_files() {
        let tmp = TempDir::new().unwrap();
        let repo = init_repo(tmp.path());
        let base = repo.head().unwrap().shorthand().unwrap().to_string();

        let wt_path = tmp.path().join(".leitwerk/worktrees/wt-reset");
        create_worktree_from_base(tmp.path(), "leitwerk/wt-reset", &wt_path, &base).unwrap();

        std::fs::write(wt_path.join("scratch.txt"), "leftover").unwrap();
        reset_worktree_to_base(&wt_path, &base).unwrap();
        assert!(!wt_path.join("scratch.txt").exists());
    }

    #[test]
    fn delete_branch_after_worktree_removal() {
        let tmp = TempDir::new().unwrap();
        let repo = init_repo(tmp.path());
        let base = repo.head().unwrap().shorthand().unwrap().to_string();

        let wt_path = tmp.path().join(".leitwerk/worktrees/wt-branch");
        create_worktree_from_base(tmp.path(), "leitwerk/wt-branch", &wt_path, &base).unwrap();
        remove_worktree(tmp.path(), &wt_path).unwrap();

        delete_branch(tmp.path(), "leitwerk/wt-branch").unwrap();
        assert!(delete_branch(tmp.path(), "leitwerk/wt-branch").is_err());
    }
}
