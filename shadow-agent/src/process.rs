use std::{
    process::{Command, Stdio},
    time::{Duration, Instant},
};

/// Exit code reported when a bounded command overruns its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a command could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Uniform result of one external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }
    }

    pub fn err(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Best human-readable failure detail: stderr, else stdout, else a stub.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_owned();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_owned();
        }
        "no detail".to_owned()
    }
}

/// Capability over the external binaries the shadow core drives, so tests can
/// substitute deterministic fakes.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> CmdOutput;
    fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> CmdOutput;
}

pub fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}

/// True when an escalated command failed because `sudo -n` had no cached
/// credential to act on.
pub fn sudo_refused(output: &CmdOutput) -> bool {
    !output.success()
        && (output.stderr.contains("a password is required")
            || output.stderr.contains("a terminal is required"))
}

/// [`CommandRunner`] backed by real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner {
    escalate: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self { escalate: false }
    }

    /// Prepend `sudo -n` to every command while not running as root.
    pub fn escalating() -> Self {
        Self { escalate: true }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        if self.escalate && !is_root() {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program).args(args);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> CmdOutput {
        match self.command(program, args).output() {
            Ok(output) => CmdOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(err) => CmdOutput::err(SPAWN_FAILURE_EXIT_CODE, &err.to_string()),
        }
    }

    fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> CmdOutput {
        let mut cmd = self.command(program, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return CmdOutput::err(SPAWN_FAILURE_EXIT_CODE, &err.to_string()),
        };

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return CmdOutput::err(
                        TIMEOUT_EXIT_CODE,
                        &format!("{program} timed out after {}s", timeout.as_secs()),
                    );
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(err) => {
                    let _ = child.kill();
                    return CmdOutput::err(-1, &err.to_string());
                }
            }
        }

        // The commands bounded here emit little output, so draining the pipes
        // after exit cannot block.
        match child.wait_with_output() {
            Ok(output) => CmdOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(err) => CmdOutput::err(-1, &err.to_string()),
        }
    }
}
