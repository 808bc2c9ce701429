// tests/common/mod.rs

#![allow(dead_code)]

use keywright_core::{Collaborators, ContextPaths, KeyContext, Lifecycle};
use keywright_keychain::{
    AgentError, AgentInterface, GeneratedKey, KeyAlgorithm, KeyGenerator, KeygenError,
};
use keywright_ssh::{Handshake, ProcessError, ProcessInvoker, ProcessOutput, TransportValidator};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const GITHUB_OK: &str = "Hi octo! You've successfully authenticated, but GitHub does not provide shell access.";
pub const ORIGIN_URL: &str = "git@github.com:acme/api.git";

/// Shared, ordered record of every collaborator call.
pub type Events = Rc<RefCell<Vec<String>>>;

static GENERATION: AtomicUsize = AtomicUsize::new(0);

pub fn key_type_line(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::Ed25519 => "ssh-ed25519",
        KeyAlgorithm::Rsa => "ssh-rsa",
        KeyAlgorithm::Ecdsa => "ecdsa-sha2-nistp256",
        KeyAlgorithm::Dsa => "ssh-dss",
    }
}

/// Writes recognisable placeholder key material, refusing to overwrite.
pub struct FakeGenerator;

impl KeyGenerator for FakeGenerator {
    fn generate(
        &self,
        dir: &Path,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: Option<&str>,
    ) -> Result<GeneratedKey, KeygenError> {
        let private_key_path = dir.join(name);
        let public_key_path = dir.join(format!("{name}.pub"));
        for path in [&private_key_path, &public_key_path] {
            if path.exists() {
                return Err(KeygenError::AlreadyExists(path.clone()));
            }
        }
        let n = GENERATION.fetch_add(1, Ordering::SeqCst);
        fs::write(&private_key_path, format!("FAKE PRIVATE {name} #{n}\n"))?;
        fs::write(
            &public_key_path,
            format!(
                "{} AAAAFAKE{n} {}\n",
                key_type_line(algorithm),
                comment.unwrap_or_default()
            ),
        )?;
        Ok(GeneratedKey {
            private_key_path,
            public_key_path,
            fingerprint: format!("SHA256:fake{n}"),
        })
    }
}

pub struct FailingGenerator;

impl KeyGenerator for FailingGenerator {
    fn generate(
        &self,
        _dir: &Path,
        _name: &str,
        _algorithm: KeyAlgorithm,
        _comment: Option<&str>,
    ) -> Result<GeneratedKey, KeygenError> {
        Err(KeygenError::Key("simulated generator failure".into()))
    }
}

pub struct FakeAgent {
    events: Events,
    fail: bool,
}

impl FakeAgent {
    fn log(&self, entry: String) -> Result<(), AgentError> {
        self.events.borrow_mut().push(entry);
        if self.fail {
            Err(AgentError::Connect("no agent in tests".into()))
        } else {
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl AgentInterface for FakeAgent {
    fn add(&self, key_path: &Path) -> Result<(), AgentError> {
        self.log(format!("agent add {}", file_name(key_path)))
    }

    fn remove(&self, key_path: &Path) -> Result<(), AgentError> {
        self.log(format!("agent remove {}", file_name(key_path)))
    }

    fn remove_all(&self) -> Result<(), AgentError> {
        self.log("agent remove_all".into())
    }
}

pub struct FakeValidator {
    output: String,
}

impl TransportValidator for FakeValidator {
    fn handshake(&self, provider: &str, test_command: &str) -> Result<Handshake, ProcessError> {
        assert!(test_command.contains(provider));
        Ok(Handshake {
            exit_code: Some(1),
            output: self.output.clone(),
        })
    }
}

pub struct FakeInvoker {
    events: Events,
    fail: bool,
}

impl ProcessInvoker for FakeInvoker {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        _cwd: Option<&Path>,
    ) -> Result<ProcessOutput, ProcessError> {
        self.events
            .borrow_mut()
            .push(format!("{program} {}", args.join(" ")));
        if self.fail {
            return Ok(ProcessOutput {
                code: Some(128),
                stdout: String::new(),
                stderr: "fatal: repository not found\n".into(),
            });
        }
        let stdout = if args.contains(&"remote.origin.url") {
            format!("{ORIGIN_URL}\n")
        } else {
            String::new()
        };
        Ok(ProcessOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

pub struct Fakes {
    pub generator: Box<dyn KeyGenerator>,
    pub agent_fails: bool,
    pub handshake_output: String,
    pub process_fails: bool,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            generator: Box::new(FakeGenerator),
            agent_fails: false,
            handshake_output: GITHUB_OK.to_string(),
            process_fails: false,
        }
    }
}

pub struct Harness {
    // Keep the tempdir alive for the duration of the test.
    root: tempfile::TempDir,
    pub paths: ContextPaths,
    pub events: Events,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let paths = ContextPaths::under(root.path());
        Self {
            root,
            paths,
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn ssh_dir(&self) -> &Path {
        &self.paths.ssh_dir
    }

    pub fn key(&self, name: &str) -> PathBuf {
        self.paths.ssh_dir.join(name)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    /// Opens a fresh context over the same directories.
    pub fn lifecycle(&self) -> Lifecycle {
        self.with(Fakes::default())
    }

    pub fn with(&self, fakes: Fakes) -> Lifecycle {
        let ctx = KeyContext::open(&self.paths, None).expect("open context");
        Lifecycle::new(
            ctx,
            Collaborators {
                generator: fakes.generator,
                agent: Box::new(FakeAgent {
                    events: self.events.clone(),
                    fail: fakes.agent_fails,
                }),
                validator: Box::new(FakeValidator {
                    output: fakes.handshake_output,
                }),
                invoker: Box::new(FakeInvoker {
                    events: self.events.clone(),
                    fail: fakes.process_fails,
                }),
            },
        )
    }
}

#[cfg(unix)]
pub fn mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
}
