//! The single seam between the reconciler and the underlying OS utilities.
//!
//! Every privileged network-configuration action flows through a
//! [`CommandRunner`] so that it can be swapped for a deterministic mock in
//! tests. No retries happen at this layer; failures are returned verbatim to
//! the caller, which decides what to do about them.

use std::process::Command;

use crate::error::Error;

/// A label identifying the call site, used only for diagnostics and to key
/// the mock transcript in tests (mirrors the `caller` argument the original
/// Go implementation threaded through `RunCommand`/`RunCommandWithOutput`).
pub trait CommandRunner {
    /// Run `command` for side effects only, discarding stdout.
    fn run_silent(&self, label: &str, command: &str) -> Result<(), Error>;

    /// Run `command` and return its captured stdout.
    fn run_with_output(&self, label: &str, command: &str) -> Result<Vec<u8>, Error>;
}

/// Executes commands through `/bin/sh -c`, the production implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run_silent(&self, label: &str, command: &str) -> Result<(), Error> {
        self.run_with_output(label, command).map(|_| ())
    }

    fn run_with_output(&self, label: &str, command: &str) -> Result<Vec<u8>, Error> {
        log::debug!("[{}] running: {}", label, command);
        let output = Command::new("/bin/sh").arg("-c").arg(command).output()?;
        if !output.status.success() {
            return Err(Error::command_failed(
                label,
                command,
                output.status,
                &output.stderr,
            ));
        }
        Ok(output.stdout)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A transcript-recording, table-driven stand-in for [`ShellCommandRunner`].
    ///
    /// Every invocation is appended to `transcript` in order. `outputs` maps
    /// an exact command string to the bytes it should "produce"; commands
    /// not present in the table succeed with empty output unless listed in
    /// `failures`.
    #[derive(Default)]
    pub struct MockCommandRunner {
        pub transcript: RefCell<Vec<(String, String)>>,
        pub outputs: HashMap<String, Vec<u8>>,
        pub failures: HashMap<String, String>,
    }

    impl MockCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_output(mut self, command: &str, output: &str) -> Self {
            self.outputs.insert(command.to_string(), output.as_bytes().to_vec());
            self
        }

        pub fn with_failure(mut self, command: &str, stderr: &str) -> Self {
            self.failures.insert(command.to_string(), stderr.to_string());
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.transcript
                .borrow()
                .iter()
                .map(|(_, cmd)| cmd.clone())
                .collect()
        }
    }

    impl CommandRunner for MockCommandRunner {
        fn run_silent(&self, label: &str, command: &str) -> Result<(), Error> {
            self.run_with_output(label, command).map(|_| ())
        }

        fn run_with_output(&self, label: &str, command: &str) -> Result<Vec<u8>, Error> {
            self.transcript
                .borrow_mut()
                .push((label.to_string(), command.to_string()));
            if let Some(stderr) = self.failures.get(command) {
                return Err(Error::CommandFailed {
                    label: label.to_string(),
                    command: command.to_string(),
                    status: Some(1),
                    stderr: stderr.clone(),
                });
            }
            Ok(self.outputs.get(command).cloned().unwrap_or_default())
        }
    }
}
