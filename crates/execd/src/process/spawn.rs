//! Starting the coprocess with all three standard streams piped.

use std::process::Stdio;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

use crate::config::ExecdConfig;
use crate::error::ExecdError;
use crate::error::ExecdResult;

/// One generation of the coprocess, streams already detached from the child.
pub(crate) struct Coprocess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawns `command[0]` with `command[1..]`, inheriting the parent's
/// environment plus the configured entries.
pub(crate) fn spawn(config: &ExecdConfig) -> ExecdResult<Coprocess> {
    let program = config.program().unwrap_or_default();
    let spawn_error = || ExecdError::Spawn {
        program: program.to_string(),
    };

    let mut cmd = Command::new(program);
    cmd.args(config.args())
        .envs(config.env_pairs().change_context_lazy(spawn_error)?)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().change_context_lazy(spawn_error)?;
    let pid = child.id();

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(Report::new(spawn_error()).attach_printable("standard streams were not piped"));
    };

    Ok(Coprocess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}
