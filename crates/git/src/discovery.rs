// crates/git/src/discovery.rs
//! Walks watched directories and identifies git repositories, including
//! linked worktrees (`.git` as a regular file pointing at the real git
//! dir). `.git` trees themselves are never descended into.

use hindsight_types::Repository;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Discover every repository under the watched directories, deduplicated
/// by canonical path. Inaccessible subtrees are skipped with a warning.
pub fn discover_repositories(watched: &[PathBuf]) -> Vec<Repository> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut repos = Vec::new();

    for root in watched {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping inaccessible path during repository discovery");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            let candidate = entry.path();
            let Some(repo) = identify_repository(candidate) else {
                continue;
            };

            let canonical = candidate
                .canonicalize()
                .unwrap_or_else(|_| candidate.to_path_buf());
            if seen.insert(canonical) {
                debug!(path = %repo.path.display(), worktree = repo.is_worktree, "repository discovered");
                repos.push(repo);
            }
        }
    }

    repos.sort_by(|a, b| a.path.cmp(&b.path));
    repos
}

/// Classify one directory: regular repository, linked worktree, or neither.
fn identify_repository(path: &Path) -> Option<Repository> {
    let git_marker = path.join(".git");
    let meta = std::fs::symlink_metadata(&git_marker).ok()?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if meta.is_dir() {
        return Some(Repository {
            path: path.to_path_buf(),
            name,
            git_dir: git_marker,
            is_worktree: false,
        });
    }

    if meta.is_file() {
        // A linked worktree keeps a one-line pointer file:
        //   gitdir: /path/to/parent/.git/worktrees/<name>
        let content = std::fs::read_to_string(&git_marker).ok()?;
        let target = content.strip_prefix("gitdir:")?.trim();
        let git_dir = if Path::new(target).is_absolute() {
            PathBuf::from(target)
        } else {
            path.join(target)
        };
        return Some(Repository {
            path: path.to_path_buf(),
            name,
            git_dir,
            is_worktree: true,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::*;
    use tempfile::tempdir;

    #[test]
    fn test_discovers_nested_repositories() {
        let dir = tempdir().unwrap();
        let repo_a = dir.path().join("code/proj-a");
        let repo_b = dir.path().join("code/nested/proj-b");
        init_repo(&repo_a);
        init_repo(&repo_b);
        std::fs::create_dir_all(dir.path().join("code/not-a-repo")).unwrap();

        let repos = discover_repositories(&[dir.path().to_path_buf()]);
        let names: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["proj-a", "proj-b"]);
        assert!(repos.iter().all(|r| !r.is_worktree));
        assert!(repos[0].git_dir.ends_with(".git"));
    }

    #[test]
    fn test_discovers_worktrees() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main-repo");
        init_repo(&main);
        commit_file(&main, "a.txt", "x\n", "first");

        let worktree = dir.path().join("wt");
        git(
            &main,
            &["worktree", "add", "-q", worktree.to_str().unwrap()],
        );

        let repos = discover_repositories(&[dir.path().to_path_buf()]);
        assert_eq!(repos.len(), 2);
        let wt = repos.iter().find(|r| r.name == "wt").unwrap();
        assert!(wt.is_worktree);
        assert!(wt.git_dir.to_string_lossy().contains("worktrees"));
    }

    #[test]
    fn test_does_not_descend_into_git_dir() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("proj");
        init_repo(&repo);
        // Plant a decoy inside .git that would look like a repo
        std::fs::create_dir_all(repo.join(".git/fake/.git")).unwrap();

        let repos = discover_repositories(&[dir.path().to_path_buf()]);
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "proj");
    }

    #[test]
    fn test_deduplicates_overlapping_watch_roots() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("proj");
        init_repo(&repo);

        let repos = discover_repositories(&[dir.path().to_path_buf(), repo.clone()]);
        assert_eq!(repos.len(), 1);
    }

    #[test]
    fn test_missing_root_is_tolerated() {
        let repos =
            discover_repositories(&[PathBuf::from("/definitely/not/here/at/all")]);
        assert!(repos.is_empty());
    }
}
