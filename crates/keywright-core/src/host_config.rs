use crate::error::CoreError;
use crate::fsio::{atomic_write, ensure_private_dir};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const HOST_CONFIG_MODE: u32 = 0o600;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub pattern: String,
    pub options: Vec<(String, String)>,
}

impl HostEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            options: Vec::new(),
        }
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the first option with this name in place, or appends it.
    pub fn set_option(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .options
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(slot) => *slot = (name.to_string(), value),
            None => self.options.push((name.to_string(), value)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HostUpdate<'a> {
    pub identity_file: Option<&'a Path>,
    pub user: Option<&'a str>,
    pub port: Option<u16>,
}

/// Reads and rewrites the SSH client configuration file.
///
/// Only `Host` blocks with `<option> <value>` lines are understood. Comments
/// and lines before the first block are dropped on rewrite.
#[derive(Clone, Debug)]
pub struct HostConfig {
    path: PathBuf,
}

impl HostConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<Vec<HostEntry>, CoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update(&self, host: &str, update: &HostUpdate<'_>) -> Result<HostEntry, CoreError> {
        require_valid_host(host)?;
        let mut entries = self.get()?;
        let index = match entries.iter().position(|e| e.pattern == host) {
            Some(index) => index,
            None => {
                entries.push(HostEntry::new(host));
                entries.len() - 1
            }
        };
        let entry = &mut entries[index];
        if let Some(key) = update.identity_file {
            entry.set_option("IdentityFile", key.display().to_string());
        }
        if let Some(user) = update.user {
            entry.set_option("User", user);
        }
        if let Some(port) = update.port {
            entry.set_option("Port", port.to_string());
        }
        let updated = entry.clone();
        self.write(&entries)?;
        info!(host = %host, options = updated.options.len(), "host config updated");
        Ok(updated)
    }

    /// `Ok(false)` when no block has this pattern; the file is untouched.
    pub fn remove(&self, host: &str) -> Result<bool, CoreError> {
        require_valid_host(host)?;
        let mut entries = self.get()?;
        let before = entries.len();
        entries.retain(|e| e.pattern != host);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(&entries)?;
        info!(host = %host, "host config entry removed");
        Ok(true)
    }

    fn write(&self, entries: &[HostEntry]) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                ensure_private_dir(parent)?;
            }
        }
        atomic_write(&self.path, render(entries).as_bytes(), HOST_CONFIG_MODE)?;
        debug!(path = %self.path.display(), hosts = entries.len(), "host config written");
        Ok(())
    }
}

pub fn validate_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*'))
}

fn require_valid_host(host: &str) -> Result<(), CoreError> {
    if validate_host(host) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid host pattern {host:?}: use letters, digits, '-', '_', '.' or '*'"
        )))
    }
}

/// Repeated `Host` blocks for one pattern are merged into the first: earlier
/// options survive, a later block only overrides the options it repeats, and
/// the merged block keeps the position of the first occurrence.
pub fn parse(content: &str) -> Vec<HostEntry> {
    let mut entries: Vec<HostEntry> = Vec::new();
    let mut current: Option<usize> = None;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(pattern) = host_pattern(line) {
            current = Some(match entries.iter().position(|e| e.pattern == pattern) {
                Some(index) => index,
                None => {
                    entries.push(HostEntry::new(pattern));
                    entries.len() - 1
                }
            });
            continue;
        }
        let (Some(index), Some((name, value))) = (current, line.split_once(' ')) else {
            continue;
        };
        entries[index].set_option(name, value.trim());
    }
    entries
}

fn host_pattern(line: &str) -> Option<&str> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let keyword = parts.next()?;
    if !keyword.eq_ignore_ascii_case("host") {
        return None;
    }
    parts.next()?.split_whitespace().next()
}

pub fn render(entries: &[HostEntry]) -> String {
    let blocks: Vec<String> = entries
        .iter()
        .map(|entry| {
            let mut block = format!("Host {}\n", entry.pattern);
            for (name, value) in &entry.options {
                block.push_str(&format!("    {} {}\n", name, value));
            }
            block
        })
        .collect();
    blocks.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> HostConfig {
        HostConfig::new(dir.path().join(".ssh").join("config"))
    }

    #[test]
    fn parses_blocks_and_skips_noise() {
        let content = "\
# global
ForwardAgent no
Host github.com
    User git
    IdentityFile ~/.ssh/id_ed25519
host   *.internal extra
  Port 2200

HostName-only
Host github.com
    Port 22
";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pattern, "github.com");
        assert_eq!(entries[0].option("user"), Some("git"));
        assert_eq!(entries[0].option("Port"), Some("22"));
        assert_eq!(entries[1].pattern, "*.internal");
        assert_eq!(entries[1].option("Port"), Some("2200"));
    }

    #[test]
    fn update_creates_file_with_requested_options() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        cfg.update(
            "example.com",
            &HostUpdate {
                user: Some("git"),
                port: Some(2222),
                ..Default::default()
            },
        )
        .unwrap();

        let entries = cfg.get().unwrap();
        assert_eq!(
            entries,
            vec![HostEntry {
                pattern: "example.com".into(),
                options: vec![
                    ("User".into(), "git".into()),
                    ("Port".into(), "2222".into())
                ],
            }]
        );
        assert_eq!(
            fs::read_to_string(cfg.path()).unwrap(),
            "Host example.com\n    User git\n    Port 2222\n"
        );
        #[cfg(unix)]
        assert_eq!(crate::fsio::file_mode(cfg.path()).unwrap(), 0o600);
    }

    #[test]
    fn update_only_touches_supplied_options() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        fs::create_dir_all(cfg.path().parent().unwrap()).unwrap();
        fs::write(
            cfg.path(),
            "Host a\n    User alice\n    Port 22\nHost b\n    User bob\n",
        )
        .unwrap();
        cfg.update(
            "a",
            &HostUpdate {
                identity_file: Some(Path::new("/keys/id_rsa")),
                port: Some(2022),
                ..Default::default()
            },
        )
        .unwrap();
        let entries = cfg.get().unwrap();
        assert_eq!(entries[0].option("User"), Some("alice"));
        assert_eq!(entries[0].option("Port"), Some("2022"));
        assert_eq!(entries[0].option("IdentityFile"), Some("/keys/id_rsa"));
        assert_eq!(entries[1].option("User"), Some("bob"));
    }

    #[test]
    fn repeated_host_blocks_merge_into_first() {
        let entries = parse(
            "Host a\n    User git\n    Port 22\nHost b\n    User b\nHost a\n    Port 2222\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pattern, "a");
        assert_eq!(entries[0].option("user"), Some("git"));
        assert_eq!(entries[0].option("Port"), Some("2222"));
        assert_eq!(entries[1].pattern, "b");
    }

    #[test]
    fn many_hosts_keep_their_order() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let hosts: Vec<String> = (0..6).map(|i| format!("host{i}.example")).collect();
        for (i, host) in hosts.iter().enumerate() {
            cfg.update(
                host,
                &HostUpdate {
                    port: Some(2000 + i as u16),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        let entries = cfg.get().unwrap();
        let patterns: Vec<&str> = entries.iter().map(|e| e.pattern.as_str()).collect();
        assert_eq!(patterns, hosts.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(entries[3].option("Port"), Some("2003"));
    }

    #[test]
    fn bad_patterns_and_missing_hosts() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        for bad in ["", "a b", "host;rm", "x\ny"] {
            assert!(matches!(
                cfg.update(bad, &HostUpdate::default()),
                Err(CoreError::Validation(_))
            ));
        }
        assert!(!cfg.path().exists());
        assert!(!cfg.remove("ghost.example").unwrap());

        cfg.update("keep", &HostUpdate::default()).unwrap();
        cfg.update("drop", &HostUpdate { user: Some("x"), ..Default::default() })
            .unwrap();
        assert!(cfg.remove("drop").unwrap());
        let patterns: Vec<String> = cfg.get().unwrap().into_iter().map(|e| e.pattern).collect();
        assert_eq!(patterns, vec!["keep"]);
    }
}
