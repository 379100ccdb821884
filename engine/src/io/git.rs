//! Git checkpoints for shell verification rollback.
//!
//! A checkpoint is the object name printed by `git stash create` (or `HEAD`
//! when the worktree is clean) plus the untracked files present at that
//! moment. Creating one never touches the worktree. Restoring checks the
//! recorded tree back out, drops files added to the index since, and cleans
//! untracked files the checkpoint did not know about.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::session::Checkpoint;

pub trait CheckpointStore: Send + Sync {
    /// Record the current worktree state; `None` outside a git repository.
    fn create(&self, workdir: &Path) -> Result<Option<Checkpoint>>;
    fn restore(&self, workdir: &Path, checkpoint: &Checkpoint) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// `git stash create`, falling back to `HEAD` on a clean worktree.
    #[instrument(skip_all)]
    pub fn stash_create(&self) -> Result<String> {
        let stash = self.run_capture(&["stash", "create"])?;
        let stash = stash.trim();
        if !stash.is_empty() {
            debug!(reference = stash, "checkpoint from stash");
            return Ok(stash.to_string());
        }
        let head = self.run_capture(&["rev-parse", "HEAD"])?;
        debug!(reference = head.trim(), "clean worktree, checkpoint at HEAD");
        Ok(head.trim().to_string())
    }

    /// Untracked paths that are not ignored, relative to the workdir.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        self.run_paths(&["ls-files", "--others", "--exclude-standard", "-z"])
    }

    /// Paths currently in the index.
    pub fn index_files(&self) -> Result<Vec<String>> {
        self.run_paths(&["ls-files", "-z"])
    }

    /// Paths recorded in `reference`'s tree below the workdir.
    pub fn tree_files(&self, reference: &str) -> Result<Vec<String>> {
        self.run_paths(&["ls-tree", "-r", "-z", "--name-only", reference])
    }

    #[instrument(skip_all, fields(reference))]
    pub fn checkout_tree(&self, reference: &str) -> Result<()> {
        self.run_checked(&["checkout", reference, "--", "."])?;
        Ok(())
    }

    /// Remove `paths` from the index and the worktree.
    pub fn remove_tracked(&self, paths: &[String]) -> Result<()> {
        self.run_on_paths(&["--literal-pathspecs", "rm", "-f", "-q", "--"], paths)
    }

    /// Delete the given untracked `paths`.
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        self.run_on_paths(&["--literal-pathspecs", "clean", "-f", "-q", "--"], paths)
    }

    fn run_on_paths(&self, args: &[&str], paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut full: Vec<&str> = args.to_vec();
        full.extend(paths.iter().map(String::as_str));
        self.run_checked(&full)?;
        Ok(())
    }

    fn run_paths(&self, args: &[&str]) -> Result<Vec<String>> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitCheckpoints;

impl CheckpointStore for GitCheckpoints {
    fn create(&self, workdir: &Path) -> Result<Option<Checkpoint>> {
        let git = Git::new(workdir);
        if !git.is_repository() {
            warn!(dir = %workdir.display(), "checkpoint requested outside a git repository");
            return Ok(None);
        }
        Ok(Some(Checkpoint {
            reference: git.stash_create()?,
            untracked: git.untracked_files()?,
        }))
    }

    #[instrument(skip_all, fields(reference = %checkpoint.reference))]
    fn restore(&self, workdir: &Path, checkpoint: &Checkpoint) -> Result<()> {
        let git = Git::new(workdir);

        let recorded: HashSet<String> = git.tree_files(&checkpoint.reference)?.into_iter().collect();
        let added: Vec<String> = git
            .index_files()?
            .into_iter()
            .filter(|p| !recorded.contains(p))
            .collect();
        git.remove_tracked(&added)?;
        git.checkout_tree(&checkpoint.reference)?;

        let known: HashSet<&str> = checkpoint.untracked.iter().map(String::as_str).collect();
        let created: Vec<String> = git
            .untracked_files()?
            .into_iter()
            .filter(|p| !known.contains(p.as_str()))
            .collect();
        git.clean_paths(&created)?;
        info!(added = added.len(), created = created.len(), "files from after the checkpoint removed");
        Ok(())
    }
}
