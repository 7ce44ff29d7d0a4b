use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/var/lib/rocker";
pub const NETNS_PATH: &str = "/var/run/rocker/net-ns";
pub const CGROUP_PATH: &str = "/sys/fs/cgroup/rocker";

/// Host resolver files probed in order; the first one present is copied
/// into the container.
pub const RESOLV_CANDIDATES: [&str; 3] = [
    "/var/run/systemd/resolve/resolv.conf",
    "/etc/rockerresolv.conf",
    "/etc/resolv.conf",
];

/// Where a runtime keeps its state on the host.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    pub netns: PathBuf,
    pub cgroups: PathBuf,
    pub resolv_candidates: Vec<PathBuf>,
}

impl Paths {
    /// `root` is made absolute and its symlinks resolved, so the paths built
    /// from it match what the kernel reports for mount points.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Paths {
            root: absolute_root(root.into()),
            netns: PathBuf::from(NETNS_PATH),
            cgroups: PathBuf::from(CGROUP_PATH),
            resolv_candidates: RESOLV_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn netns_handle(&self, id: &str) -> PathBuf {
        self.netns.join(id)
    }

    /// Layout rooted somewhere other than the system locations, so nothing
    /// touches real mounts or cgroups.
    #[cfg(test)]
    pub fn sandboxed(base: &Path) -> Self {
        Paths {
            root: base.join("root"),
            netns: base.join("netns"),
            cgroups: base.join("cgroup"),
            resolv_candidates: vec![
                base.join("host/systemd-resolv.conf"),
                base.join("host/rockerresolv.conf"),
                base.join("host/resolv.conf"),
            ],
        }
    }
}

/// Resolves `root` when it exists; a root not created yet is only made
/// absolute.
fn absolute_root(root: PathBuf) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(&root) {
        return resolved;
    }
    std::path::absolute(&root).unwrap_or(root)
}
