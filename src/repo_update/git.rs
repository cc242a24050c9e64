use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// The git operations a repository refresh needs.
pub trait GitOps: Send + Sync {
    /// Current `HEAD` revision, or an empty string when `HEAD` does not
    /// resolve yet (a clone with no commits).
    fn head(&self, repo: &Path) -> Result<String>;
    /// Re-read which branch `origin/HEAD` points at.
    fn refresh_default_branch(&self, repo: &Path) -> Result<()>;
    /// Fetch and hard-reset to the remote default branch. Local changes are
    /// discarded.
    fn sync(&self, repo: &Path) -> Result<()>;
    fn gc(&self, repo: &Path) -> Result<()>;
}

/// [`GitOps`] through the `git` command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitCli;

impl GitCli {
    /// Remote-tracking ref of the default branch, e.g. `origin/main`.
    fn remote_default(&self, repo: &Path) -> Result<String> {
        let output = run_git(repo, ["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])?;
        if output.status.success() {
            let target = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !target.is_empty() {
                return Ok(target);
            }
        }

        // No origin/HEAD recorded: follow the branch that is checked out.
        let branch = git_stdout(repo, ["rev-parse", "--abbrev-ref", "HEAD"])?;
        if branch.is_empty() || branch == "HEAD" {
            bail!(
                "cannot determine default branch of {}; run `git remote set-head origin --auto`",
                repo.display()
            );
        }
        Ok(format!("origin/{branch}"))
    }
}

impl GitOps for GitCli {
    fn head(&self, repo: &Path) -> Result<String> {
        let output = run_git(repo, ["rev-parse", "--verify", "-q", "HEAD"])?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        // `--verify -q` exits 1 quietly when HEAD is unborn; anything else is a
        // real failure (not a repository, permissions...).
        if output.status.code() == Some(1) && output.stderr.is_empty() {
            return Ok(String::new());
        }
        bail!(
            "git rev-parse HEAD failed in {}: {}",
            repo.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    fn refresh_default_branch(&self, repo: &Path) -> Result<()> {
        git_stdout(repo, ["remote", "set-head", "origin", "--auto"])?;
        debug!(repo = %repo.display(), "default branch refreshed");
        Ok(())
    }

    fn sync(&self, repo: &Path) -> Result<()> {
        git_stdout(repo, ["fetch", "--prune", "--quiet", "origin"])?;
        let target = self.remote_default(repo)?;
        git_stdout(repo, ["reset", "--hard", "--quiet", target.as_str()])?;
        debug!(repo = %repo.display(), target = %target, "repository synced");
        Ok(())
    }

    fn gc(&self, repo: &Path) -> Result<()> {
        git_stdout(repo, ["gc", "--quiet"])?;
        Ok(())
    }
}

fn run_git<I, S>(repo_root: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git in {}", repo_root.display()))
}

/// Run git and return trimmed stdout; a non-zero exit is an error carrying
/// git's stderr.
fn git_stdout<const N: usize>(repo_root: &Path, args: [&str; N]) -> Result<String> {
    let output = run_git(repo_root, args)?;
    if !output.status.success() {
        bail!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo_root.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
