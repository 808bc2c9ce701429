use crate::documents::RepoLink;
use crate::error::CoreError;
use crate::lifecycle::{Lifecycle, Outcome};
use crate::store::validate_repo_url;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Clone, Debug, Default)]
pub struct CloneRequest {
    /// Full remote URL or `owner/repo` shorthand.
    pub repo: String,
    pub provider: String,
    pub key: Option<String>,
    pub dest: Option<PathBuf>,
    pub git_email: Option<String>,
    pub git_name: Option<String>,
}

/// Expands `owner/repo` to `git@<provider>:owner/repo.git`; full URLs pass
/// through unchanged.
pub fn expand_repo_url(repo: &str, provider: &str) -> String {
    if repo.contains("://") || repo.starts_with("git@") {
        return repo.to_string();
    }
    let repo = repo.trim_matches('/');
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    format!("git@{provider}:{repo}.git")
}

/// Directory `git clone` creates when no destination is given.
pub fn checkout_dir_name(url: &str) -> Option<String> {
    let last = url.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

impl Lifecycle {
    /// Clones with `key` registered in the agent for the duration of the
    /// clone. The key is deregistered afterwards whatever the result.
    pub fn clone_repo(&mut self, request: &CloneRequest) -> Result<Outcome, CoreError> {
        let url = expand_repo_url(&request.repo, &request.provider);
        if !validate_repo_url(&url) {
            return Err(CoreError::Validation(format!("invalid repository URL {url:?}")));
        }
        let key = match request
            .key
            .clone()
            .or_else(|| self.ctx.store.repo_key(&url).map(str::to_string))
        {
            Some(key) => key,
            None => {
                return Ok(Outcome::fail(format!(
                    "No key given and no key linked to {url}"
                )))
            }
        };
        let key_path = self.key_path(&key)?;
        if !key_path.is_file() {
            return Ok(Outcome::fail(format!("Key {key} not found")));
        }

        if let Err(reason) = self.agent_add_checked(&key, &key_path) {
            return Ok(Outcome::fail(reason));
        }
        self.ctx.store.record_use(&key)?;

        let dest = request.dest.as_ref().map(|d| d.display().to_string());
        let mut args = vec!["clone", url.as_str()];
        if let Some(dest) = dest.as_deref() {
            args.push(dest);
        }
        let cloned = self.invoker.run("git", &args, None);

        if let Err(err) = self.agent.remove(&key_path) {
            warn!(key = %key, error = %err, "temporary agent registration not removed");
        }

        let output = match cloned {
            Ok(output) => output,
            Err(err) => return Ok(Outcome::fail(format!("Failed to clone repository: {err}"))),
        };
        if !output.success() {
            return Ok(Outcome::fail(format!(
                "Failed to clone repository: {}",
                output.stderr.trim()
            )));
        }
        info!(url = %url, key = %key, "repository cloned");

        let checkout = request
            .dest
            .clone()
            .or_else(|| checkout_dir_name(&url).map(PathBuf::from));
        let mut lines = vec!["Repository cloned successfully".to_string()];
        for (setting, value) in [
            ("user.email", request.git_email.as_deref()),
            ("user.name", request.git_name.as_deref()),
        ] {
            let (Some(value), Some(dir)) = (value, checkout.as_deref()) else {
                continue;
            };
            lines.push(self.configure_checkout(dir, setting, value));
        }

        self.ctx.store.link_repo_key(&url, &key)?;
        Ok(Outcome::ok(lines.join("\n")))
    }

    /// Links the `origin` remote of a local checkout to `key`.
    pub fn link_checkout(&mut self, checkout: &Path, key: &str) -> Result<Outcome, CoreError> {
        self.ctx.guard.require_valid_name(key)?;
        let output = match self.invoker.run(
            "git",
            &["config", "--get", "remote.origin.url"],
            Some(checkout),
        ) {
            Ok(output) => output,
            Err(err) => {
                return Ok(Outcome::fail(format!(
                    "Failed to get repository URL: {err}"
                )))
            }
        };
        if !output.success() {
            return Ok(Outcome::fail(format!(
                "Failed to get repository URL: {}",
                output.stderr.trim()
            )));
        }
        let url = output.stdout.trim().to_string();
        self.link_repo(&url, key)
    }

    pub fn link_repo(&mut self, url: &str, key: &str) -> Result<Outcome, CoreError> {
        self.ctx.store.link_repo_key(url, key)?;
        Ok(Outcome::ok(format!("Linked {url} to {key}")))
    }

    pub fn repo_links(&self, repo: Option<&str>, key: Option<&str>) -> Vec<RepoLink> {
        self.ctx.store.repo_links(repo, key)
    }

    fn configure_checkout(&self, dir: &Path, setting: &str, value: &str) -> String {
        match self.invoker.run("git", &["config", setting, value], Some(dir)) {
            Ok(output) if output.success() => format!("Configured Git {setting}: {value}"),
            Ok(output) => {
                warn!(setting = %setting, stderr = %output.stderr.trim(), "git config failed");
                format!("Failed to set Git {setting}: {}", output.stderr.trim())
            }
            Err(err) => format!("Failed to set Git {setting}: {err}"),
        }
    }
}
