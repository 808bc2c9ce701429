use crate::process::{ProcessError, ProcessInvoker};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Attempts an authenticated handshake against a provider and reports the
/// raw diagnostic text. Interpreting that text is the caller's job.
pub trait TransportValidator {
    fn handshake(&self, provider: &str, test_command: &str) -> Result<Handshake, ProcessError>;
}

#[derive(Clone, Debug)]
pub struct CommandValidator<P> {
    invoker: P,
}

impl<P: ProcessInvoker> CommandValidator<P> {
    pub fn new(invoker: P) -> Self {
        Self { invoker }
    }
}

impl<P: ProcessInvoker> TransportValidator for CommandValidator<P> {
    fn handshake(&self, provider: &str, test_command: &str) -> Result<Handshake, ProcessError> {
        let fallback = format!("ssh -T git@{}", provider);
        let line = if test_command.trim().is_empty() {
            fallback.as_str()
        } else {
            test_command
        };
        let mut words = line.split_whitespace();
        let program = words.next().ok_or(ProcessError::EmptyCommand)?;
        let mut args: Vec<&str> = Vec::new();
        // ssh must never stop to prompt; stdin is closed.
        if program == "ssh" {
            args.extend([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
            ]);
        }
        args.extend(words);

        info!(provider = %provider, "validating provider handshake");
        let out = self.invoker.run(program, &args, None)?;
        let mut output = out.stderr;
        if !out.stdout.trim().is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&out.stdout);
        }
        Ok(Handshake {
            exit_code: out.code,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use std::cell::RefCell;
    use std::path::Path;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl ProcessInvoker for &Recorder {
        fn run(
            &self,
            program: &str,
            args: &[&str],
            _cwd: Option<&Path>,
        ) -> Result<ProcessOutput, ProcessError> {
            self.calls.borrow_mut().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ));
            Ok(ProcessOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "Hi octo! You've successfully authenticated, but GitHub does not provide shell access.\n".to_string(),
            })
        }
    }

    #[test]
    fn ssh_probe_runs_in_batch_mode() {
        let recorder = Recorder::default();
        let validator = CommandValidator::new(&recorder);
        let shake = validator
            .handshake("github.com", "ssh -T git@github.com")
            .unwrap();
        assert_eq!(shake.exit_code, Some(1));
        assert!(shake.output.contains("successfully authenticated"));

        let calls = recorder.calls.borrow();
        let (program, args) = &calls[0];
        assert_eq!(program, "ssh");
        assert_eq!(
            args,
            &["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new", "-T", "git@github.com"]
        );
    }

    #[test]
    fn blank_command_falls_back_to_provider_host() {
        let recorder = Recorder::default();
        CommandValidator::new(&recorder)
            .handshake("gitlab.com", "  ")
            .unwrap();
        let calls = recorder.calls.borrow();
        assert_eq!(calls[0].1.last().map(String::as_str), Some("git@gitlab.com"));
    }
}
