use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::Args;

use crate::config::Paths;

/// Identifier of one container run: 6 random bytes as 12 hex characters.
///
/// Uniqueness is not checked; two concurrent runs colliding is accepted as
/// improbable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn generate() -> Self {
        let bytes: [u8; 6] = rand::random();
        ContainerId(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = anyhow::Error;

    /// Ids end up as path components, so anything that could escape the
    /// containers directory is refused.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "." || s == ".." || s.contains('/') || s.contains('\0') {
            bail!("invalid container id '{}'", s);
        }
        Ok(ContainerId(s.to_string()))
    }
}

/// Resource limits applied to the container's cgroup. `None` (or zero on the
/// command line) leaves the resource unconstrained.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    #[arg(long = "mem", value_name = "MB")]
    pub memory_mb: Option<u64>,

    /// Swap limit in megabytes
    #[arg(long = "swap", value_name = "MB")]
    pub swap_mb: Option<u64>,

    /// Maximum number of processes
    #[arg(long)]
    pub pids: Option<u64>,

    /// CPU quota as a fraction of one core (e.g. 0.5)
    #[arg(long)]
    pub cpus: Option<f64>,
}

impl ResourceLimits {
    /// Folds zero values into "unset".
    pub fn normalized(self) -> Self {
        ResourceLimits {
            memory_mb: self.memory_mb.filter(|v| *v > 0),
            swap_mb: self.swap_mb.filter(|v| *v > 0),
            pids: self.pids.filter(|v| *v > 0),
            cpus: self.cpus.filter(|v| *v > 0.0),
        }
    }

    /// Command-line flags that reproduce these limits.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(mem) = self.memory_mb {
            args.push(format!("--mem={}", mem));
        }
        if let Some(swap) = self.swap_mb {
            args.push(format!("--swap={}", swap));
        }
        if let Some(pids) = self.pids {
            args.push(format!("--pids={}", pids));
        }
        if let Some(cpus) = self.cpus {
            args.push(format!("--cpus={}", cpus));
        }
        args
    }
}

/// On-disk layout of one container:
/// `{root}/containers/{id}/fs/{mnt,upperdir,workdir}`.
#[derive(Debug, Clone)]
pub struct ContainerLayout {
    pub home: PathBuf,
    pub fs: PathBuf,
    pub mnt: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
}

impl ContainerLayout {
    pub fn new(paths: &Paths, id: &ContainerId) -> Self {
        let home = paths.containers().join(id.as_str());
        let fs = home.join("fs");
        ContainerLayout {
            mnt: fs.join("mnt"),
            upper: fs.join("upperdir"),
            work: fs.join("workdir"),
            fs,
            home,
        }
    }

    /// Creates the container directories. Directories that already exist
    /// are left untouched.
    pub fn create_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.fs, &self.mnt, &self.upper, &self.work] {
            create_dir_if_absent(dir)?;
        }
        tracing::debug!(home = %self.home.display(), "container directories ready");
        Ok(())
    }
}

fn create_dir_if_absent(dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 12);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(ContainerId::generate(), id);
    }

    #[test]
    fn test_parse_id() {
        assert_eq!("cid123".parse::<ContainerId>().unwrap().as_str(), "cid123");
        assert!("".parse::<ContainerId>().is_err());
        assert!("..".parse::<ContainerId>().is_err());
        assert!("../etc".parse::<ContainerId>().is_err());
    }

    #[test]
    fn test_layout_paths() {
        let paths = Paths::new("/var/lib/rocker");
        let layout = ContainerLayout::new(&paths, &"0a1b2c3d4e5f".parse().unwrap());
        assert_eq!(layout.home, Path::new("/var/lib/rocker/containers/0a1b2c3d4e5f"));
        assert_eq!(layout.mnt, Path::new("/var/lib/rocker/containers/0a1b2c3d4e5f/fs/mnt"));
        assert_eq!(layout.upper, Path::new("/var/lib/rocker/containers/0a1b2c3d4e5f/fs/upperdir"));
        assert_eq!(layout.work, Path::new("/var/lib/rocker/containers/0a1b2c3d4e5f/fs/workdir"));
    }

    #[test]
    fn test_create_dirs_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let layout = ContainerLayout::new(&paths, &ContainerId::generate());

        layout.create_dirs().unwrap();
        std::fs::write(layout.upper.join("kept"), "state").unwrap();
        layout.create_dirs().unwrap();

        assert!(layout.mnt.is_dir());
        assert!(layout.work.is_dir());
        assert_eq!(std::fs::read_to_string(layout.upper.join("kept")).unwrap(), "state");
        assert_eq!(std::fs::read_dir(&layout.fs).unwrap().count(), 3);
    }

    #[test]
    fn test_limits_zero_means_unset() {
        let limits = ResourceLimits {
            memory_mb: Some(0),
            swap_mb: Some(0),
            pids: Some(64),
            cpus: Some(0.0),
        }
        .normalized();
        assert_eq!(
            limits,
            ResourceLimits {
                pids: Some(64),
                ..Default::default()
            }
        );
        assert_eq!(limits.to_args(), vec!["--pids=64"]);
    }
}
