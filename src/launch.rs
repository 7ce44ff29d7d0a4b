//! Re-executing ourselves inside new namespaces.
//!
//! PID namespaces only apply to newly created processes, so the parent
//! clones a child with the namespace flags and has it exec this same binary
//! in child mode. All container parameters travel in that child's argv.

use std::ffi::{CStr, CString};
use std::path::Path;
use std::process::Command;

use anyhow::{Context, bail};
use clap::Args;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, execv};

use crate::container::{ContainerId, ResourceLimits};

pub const CHILD_MODE: &str = "child-mode";
const SELF_EXE: &str = "/proc/self/exe";
const STACK_SIZE: usize = 1024 * 1024;

/// The network namespace is not in this set: it is created beforehand by
/// `setup-netns` and joined from inside the child.
pub const NAMESPACES: CloneFlags = CloneFlags::CLONE_NEWPID
    .union(CloneFlags::CLONE_NEWNS)
    .union(CloneFlags::CLONE_NEWUTS)
    .union(CloneFlags::CLONE_NEWIPC);

/// Everything the namespaced child needs, as it crosses the exec boundary:
/// `[--mem=N] [--swap=N] [--pids=N] [--cpus=F] --img=<digest> <id> <command...>`
#[derive(Args, Debug, Clone, PartialEq)]
pub struct NamespaceParams {
    #[command(flatten)]
    pub limits: ResourceLimits,

    /// Digest of the image mounted as the container root
    #[arg(long = "img", value_name = "DIGEST")]
    pub image_digest: String,

    /// Drop all capabilities before running the command
    #[arg(long)]
    pub drop_caps: bool,

    pub container_id: ContainerId,

    /// Command to execute in the container, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl NamespaceParams {
    /// Serializes the parameters, without the child-mode marker.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.limits.to_args();
        args.push(format!("--img={}", self.image_digest));
        if self.drop_caps {
            args.push("--drop-caps".to_string());
        }
        args.push(self.container_id.to_string());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Full argv of the child: marker, root, then the serialized parameters.
pub fn child_argv(root: &Path, params: &NamespaceParams) -> Vec<String> {
    let mut argv = vec![
        "rocker".to_string(),
        CHILD_MODE.to_string(),
        format!("--root={}", root.display()),
    ];
    argv.extend(params.to_args());
    argv
}

/// Starts the namespaced child and blocks until it exits. Anything but a
/// clean exit is an error.
pub fn launch(root: &Path, params: &NamespaceParams) -> anyhow::Result<()> {
    // built before cloning so the child only has to exec
    let argv = child_argv(root, params)
        .into_iter()
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to convert arguments to CString")?;
    let exe = CString::new(SELF_EXE).context("failed to convert path to CString")?;

    let mut stack = vec![0u8; STACK_SIZE];
    // SAFETY: the child runs on its own stack and only calls execv, which
    // does not return on success.
    let child_pid = unsafe {
        clone(
            Box::new(|| exec_self(&exe, &argv)),
            &mut stack,
            NAMESPACES,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .context("Failed to clone process")?;

    tracing::info!(pid = %child_pid, id = %params.container_id, "started namespaced child");
    let code = wait_for_child(child_pid)?;
    if code != 0 {
        bail!("container process exited with status {}", code);
    }
    Ok(())
}

/// Body of the cloned child. Only returns if the exec failed, with the
/// exit code the parent will see.
fn exec_self(exe: &CStr, argv: &[CString]) -> isize {
    if let Err(e) = execv(exe, argv) {
        eprintln!("Failed to execute {:?}: {}", exe, e);
    }
    127
}

fn wait_for_child(pid: Pid) -> anyhow::Result<i32> {
    let code = match waitpid(pid, None).context("Failed to wait for child process")? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    };
    Ok(code)
}

/// Runs one of our own internal subcommands (`setup-netns`, `setup-veth`)
/// as a separate process and waits for it.
pub fn run_helper(root: &Path, subcommand: &str, id: &ContainerId) -> anyhow::Result<()> {
    let status = Command::new(SELF_EXE)
        .arg(subcommand)
        .arg(format!("--root={}", root.display()))
        .arg(id.as_str())
        .status()
        .with_context(|| format!("Failed to execute {}", subcommand))?;
    if !status.success() {
        bail!("{} {} exited with {}", subcommand, id, status);
    }
    Ok(())
}
