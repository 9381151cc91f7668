// crates/git/src/extract.rs
//! Commit metadata and diff extraction.
//!
//! Diffs compare against the first parent, or the empty tree for a root
//! commit. The assembled patch text is capped at 5 000 lines; per-file
//! stats always stay complete, and only per-file patch text past the cap
//! is dropped.

use crate::exec::{run_git, run_git_retry, GitError};
use hindsight_types::{Commit, CommitDiff, FileDiff, Repository};
use tracing::debug;

/// Hard cap on stored diff text, in lines.
pub const MAX_DIFF_LINES: usize = 5000;

/// The empty tree object — the diff base for a root commit.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Unit separator used to split `git show` format fields.
const FIELD_SEP: char = '\u{1f}';

/// Extract commit metadata: author, message, timestamp, branch, parents.
pub async fn extract_metadata(repo: &Repository, hash: &str) -> Result<Commit, GitError> {
    let format = format!("%H{FIELD_SEP}%an{FIELD_SEP}%ae{FIELD_SEP}%at{FIELD_SEP}%P{FIELD_SEP}%B");
    let out = run_git_retry(
        &repo.path,
        &["show", "-s", &format!("--format={format}"), hash],
    )
    .await?;

    let parts: Vec<&str> = out.splitn(6, FIELD_SEP).collect();
    if parts.len() != 6 {
        return Err(GitError::BadOutput(format!(
            "expected 6 metadata fields, got {}",
            parts.len()
        )));
    }

    let timestamp_secs: i64 = parts[3]
        .trim()
        .parse()
        .map_err(|_| GitError::BadOutput(format!("bad commit timestamp: {}", parts[3])))?;
    let parent_hashes: Vec<String> = parts[4]
        .split_whitespace()
        .map(str::to_string)
        .collect();

    Ok(Commit {
        hash: parts[0].trim().to_string(),
        repository_path: repo.path.to_string_lossy().into_owned(),
        repository_name: repo.name.clone(),
        message: parts[5].trim_end().to_string(),
        author_name: parts[1].trim().to_string(),
        author_email: parts[2].trim().to_string(),
        timestamp: timestamp_secs * 1000,
        branch: current_branch(repo).await,
        is_merge: parent_hashes.len() > 1,
        parent_hashes,
    })
}

/// Branch of the repository's HEAD: `"detached"` when off-branch,
/// `"unknown"` when detection fails.
async fn current_branch(repo: &Repository) -> String {
    match run_git(&repo.path, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        Ok(out) => {
            let name = out.trim().to_string();
            if name == "HEAD" {
                "detached".to_string()
            } else if name.is_empty() {
                "unknown".to_string()
            } else {
                name
            }
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Extract the commit's diff against its first parent with per-file stats.
pub async fn extract_diff(repo: &Repository, hash: &str) -> Result<CommitDiff, GitError> {
    let parents = run_git_retry(&repo.path, &["show", "-s", "--format=%P", hash]).await?;
    let base = parents
        .split_whitespace()
        .next()
        .unwrap_or(EMPTY_TREE)
        .to_string();

    let numstat = run_git_retry(&repo.path, &["diff", "--numstat", &base, hash]).await?;
    let mut files = parse_numstat(&numstat);

    let patch = run_git_retry(
        &repo.path,
        &["diff", "--patch", "--no-color", &base, hash],
    )
    .await?;
    let sections = split_patch_sections(&patch);
    let (full_diff, truncated, total_lines, shown_lines) = truncate_diff(&patch);

    for file in &mut files {
        if let Some((start_line, text)) = sections.get(file.path.as_str()) {
            // Sections starting past the cap lose their text, never their stats
            if *start_line < shown_lines as usize {
                file.diff = Some(text.clone());
            }
        }
    }

    debug!(
        hash,
        files = files.len(),
        total_lines,
        truncated,
        "diff extracted"
    );

    Ok(CommitDiff {
        files,
        full_diff,
        truncated,
        total_lines,
        shown_lines,
    })
}

/// Metadata plus diff in one call.
pub async fn extract_commit(
    repo: &Repository,
    hash: &str,
) -> Result<(Commit, CommitDiff), GitError> {
    let commit = extract_metadata(repo, hash).await?;
    let diff = extract_diff(repo, hash).await?;
    Ok((commit, diff))
}

/// Parse `git diff --numstat` lines: `added<TAB>deleted<TAB>path`.
/// Binary files report `-` and count as 0/0.
fn parse_numstat(output: &str) -> Vec<FileDiff> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next()?.trim();
            let deletions = parts.next()?.trim();
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(FileDiff {
                path: path.to_string(),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
                diff: None,
            })
        })
        .collect()
}

/// Split a patch into per-file sections keyed by path, remembering the
/// line offset each section starts at.
fn split_patch_sections(patch: &str) -> std::collections::HashMap<&str, (usize, String)> {
    let mut sections = std::collections::HashMap::new();
    let mut current: Option<(&str, usize, Vec<&str>)> = None;

    for (line_no, line) in patch.lines().enumerate() {
        if let Some(header_path) = line
            .strip_prefix("diff --git ")
            .and_then(|rest| rest.rsplit_once(" b/"))
            .map(|(_, b_path)| b_path)
        {
            if let Some((path, start, lines)) = current.take() {
                sections.insert(path, (start, lines.join("\n")));
            }
            current = Some((header_path, line_no, vec![line]));
        } else if let Some((_, _, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((path, start, lines)) = current.take() {
        sections.insert(path, (start, lines.join("\n")));
    }
    sections
}

/// Apply the 5 000-line cap: `(text, truncated, total_lines, shown_lines)`.
fn truncate_diff(patch: &str) -> (String, bool, i64, i64) {
    let total = patch.lines().count();
    if total > MAX_DIFF_LINES {
        let shown: Vec<&str> = patch.lines().take(MAX_DIFF_LINES).collect();
        (
            shown.join("\n"),
            true,
            total as i64,
            MAX_DIFF_LINES as i64,
        )
    } else {
        (patch.to_string(), false, total as i64, total as i64)
    }
}
