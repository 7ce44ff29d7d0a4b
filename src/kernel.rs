//! Thin capability layer over the kernel primitives a container run needs.
//!
//! Everything that touches global kernel state (mount table, namespaces,
//! cgroups, process creation) goes through [`Kernel`], so the ordering of
//! the lifecycle can be checked without root.

use std::fs::{self, File};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, bail};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns};
use nix::unistd::{chdir, chroot, sethostname};

use crate::cgroups::Cgroup;
use crate::config::Paths;
use crate::container::ResourceLimits;

/// Arguments of a single `mount(2)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: Option<String>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountSpec {
    /// A pseudo filesystem such as `proc` or `tmpfs`, mounted with no options.
    pub fn pseudo(fstype: &str, target: impl Into<PathBuf>) -> Self {
        MountSpec {
            source: Some(fstype.to_string()),
            target: target.into(),
            fstype: Some(fstype.to_string()),
            flags: MsFlags::empty(),
            data: None,
        }
    }

    /// Recursively switches the mount tree at `target` to private propagation.
    pub fn private(target: impl Into<PathBuf>) -> Self {
        MountSpec {
            source: None,
            target: target.into(),
            fstype: None,
            flags: MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            data: None,
        }
    }
}

/// The user command, as it will be executed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub drop_caps: bool,
}

pub trait Kernel {
    fn mount(&self, spec: &MountSpec) -> anyhow::Result<()>;
    fn unmount(&self, target: &Path) -> anyhow::Result<()>;
    fn is_mounted(&self, target: &Path) -> anyhow::Result<bool>;
    fn create_dirs(&self, dirs: &[&Path]) -> anyhow::Result<()>;
    /// Changes the root directory and moves the working directory to `/`.
    fn chroot(&self, root: &Path) -> anyhow::Result<()>;
    fn set_hostname(&self, name: &str) -> anyhow::Result<()>;
    fn join_netns(&self, handle: &Path) -> anyhow::Result<()>;
    /// Creates the cgroup for `id`, applies `limits` and moves the calling
    /// process into it.
    fn apply_cgroup(&self, id: &str, limits: &ResourceLimits) -> anyhow::Result<()>;
    fn remove_cgroup(&self, id: &str) -> anyhow::Result<()>;
    fn loopback_up(&self) -> anyhow::Result<()>;
    /// Runs the workload with inherited stdio and waits for it.
    fn exec(&self, workload: &Workload) -> anyhow::Result<ExitStatus>;
}

/// The real kernel, reached through `nix` and `libc`.
pub struct Host<'a> {
    paths: &'a Paths,
}

impl<'a> Host<'a> {
    pub fn new(paths: &'a Paths) -> Self {
        Host { paths }
    }
}

impl Kernel for Host<'_> {
    fn mount(&self, spec: &MountSpec) -> anyhow::Result<()> {
        mount(
            spec.source.as_deref(),
            &spec.target,
            spec.fstype.as_deref(),
            spec.flags,
            spec.data.as_deref(),
        )
        .with_context(|| format!("failed to mount {:?} at {:?}", spec.fstype, spec.target))?;
        tracing::debug!(target = %spec.target.display(), fstype = ?spec.fstype, "mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        umount2(target, MntFlags::empty())
            .with_context(|| format!("failed to unmount {:?}", target))?;
        tracing::debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> anyhow::Result<bool> {
        let mountinfo = fs::read_to_string("/proc/self/mountinfo")
            .context("failed to read /proc/self/mountinfo")?;
        Ok(mountinfo_contains(&mountinfo, &resolve_mount_point(target)))
    }

    fn create_dirs(&self, dirs: &[&Path]) -> anyhow::Result<()> {
        for dir in dirs {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
        }
        Ok(())
    }

    fn chroot(&self, root: &Path) -> anyhow::Result<()> {
        chroot(root).with_context(|| format!("chroot to {:?}", root))?;
        chdir("/").context("chdir to /")?;
        Ok(())
    }

    fn set_hostname(&self, name: &str) -> anyhow::Result<()> {
        sethostname(name).with_context(|| format!("failed to set hostname to {}", name))?;
        Ok(())
    }

    fn join_netns(&self, handle: &Path) -> anyhow::Result<()> {
        let ns = File::open(handle).with_context(|| format!("failed to open {:?}", handle))?;
        setns(&ns, CloneFlags::CLONE_NEWNET)
            .with_context(|| format!("setns into {:?}", handle))?;
        Ok(())
    }

    fn apply_cgroup(&self, id: &str, limits: &ResourceLimits) -> anyhow::Result<()> {
        let cgroup = Cgroup::create(&self.paths.cgroups, id)?;
        cgroup.configure(limits)?;
        cgroup.add_process(std::process::id())?;
        Ok(())
    }

    fn remove_cgroup(&self, id: &str) -> anyhow::Result<()> {
        Cgroup::remove(&self.paths.cgroups, id)
    }

    fn loopback_up(&self) -> anyhow::Result<()> {
        set_interface_up("lo")
    }

    fn exec(&self, workload: &Workload) -> anyhow::Result<ExitStatus> {
        let mut cmd = Command::new(&workload.program);
        cmd.args(&workload.args).env_clear().envs(workload.env.iter().cloned());

        if workload.drop_caps {
            use std::os::unix::process::CommandExt;
            // SAFETY: the closure only issues prctl/capset syscalls between
            // fork and exec.
            unsafe {
                cmd.pre_exec(|| drop_all_caps().map_err(std::io::Error::other));
            }
        }

        cmd.status()
            .with_context(|| format!("failed to execute {}", workload.program))
    }
}

fn drop_all_caps() -> Result<(), caps::errors::CapsError> {
    use caps::CapSet;

    // bounding set first: dropping it needs CAP_SETPCAP in the effective set
    for set in [
        CapSet::Bounding,
        CapSet::Ambient,
        CapSet::Inheritable,
        CapSet::Effective,
        CapSet::Permitted,
    ] {
        caps::clear(None, set)?;
    }
    Ok(())
}

/// Sets IFF_UP on an interface of the current network namespace. Done with
/// ioctls rather than `ip` because the container root may not ship it.
fn set_interface_up(name: &str) -> anyhow::Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        bail!("interface name {} is too long", name);
    }

    // SAFETY: plain socket(2) call; the returned descriptor is checked and
    // owned below.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error()).context("failed to open control socket");
    }
    // SAFETY: `raw` is a freshly opened descriptor nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifreq is plain old data, all-zero is a valid value.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }

    use std::os::fd::AsRawFd;
    // SAFETY: `req` is a valid ifreq with a NUL-terminated name and the
    // socket is open for the duration of both calls.
    unsafe {
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req as *mut libc::ifreq) < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to read flags of {}", name));
        }
        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req as *const libc::ifreq) < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to bring up {}", name));
        }
    }

    Ok(())
}

/// The path the kernel reports for `target` in mountinfo: symlinks and
/// relative components in its parent resolved. The last component is kept
/// as is, since it may itself be a bind-mounted file. Returns `target`
/// unchanged when the parent does not exist.
pub fn resolve_mount_point(target: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
        return target.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    match fs::canonicalize(parent) {
        Ok(parent) => parent.join(name),
        Err(_) => target.to_path_buf(),
    }
}

/// Whether `target` is a mount point according to a mountinfo table.
/// `target` must already be resolved, see [`resolve_mount_point`].
pub fn mountinfo_contains(mountinfo: &str, target: &Path) -> bool {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|point| Path::new(&unescape_mount_point(point)) == target)
}

/// Mount points in mountinfo escape space, tab, newline and backslash as
/// three-digit octal sequences.
fn unescape_mount_point(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && (b'0'..=b'3').contains(&bytes[i + 1])
            && bytes[i + 2..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
