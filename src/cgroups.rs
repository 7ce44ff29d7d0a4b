use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::container::ResourceLimits;

const MB: u64 = 1024 * 1024;
const CPU_PERIOD: u64 = 100_000;
const CONTROLLERS: &str = "+cpu +memory +pids";

/// A cgroup v2 leaf holding one container's processes.
///
/// Unlike a scoped guard, the cgroup outlives the process that created it:
/// it is made from inside the container and removed by the parent once the
/// container has exited.
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Creates `{base}/{id}`, enabling the controllers it needs on the way.
    pub fn create(base: &Path, id: &str) -> Result<Self> {
        ensure_base_cgroup(base).context("Failed to setup base cgroup")?;

        let path = base.join(id);
        if !path.exists() {
            fs::create_dir(&path)
                .with_context(|| format!("Failed to create cgroup at {:?}", path))?;
        }
        tracing::debug!(path = %path.display(), "cgroup created");
        Ok(Cgroup { path })
    }

    /// Writes the limits that are set; unset ones keep the kernel default,
    /// which is no limit.
    pub fn configure(&self, limits: &ResourceLimits) -> Result<()> {
        if let Some(mem) = limits.memory_mb {
            self.write("memory.max", &megabytes(mem, "--mem")?.to_string())
                .with_context(|| format!("Failed to set memory limit to {}MB", mem))?;
        }
        if let Some(swap) = limits.swap_mb {
            self.write("memory.swap.max", &megabytes(swap, "--swap")?.to_string())
                .with_context(|| format!("Failed to set swap limit to {}MB", swap))?;
        }
        if let Some(pids) = limits.pids {
            self.write("pids.max", &pids.to_string())
                .with_context(|| format!("Failed to set pids limit to {}", pids))?;
        }
        if let Some(cpus) = limits.cpus {
            let quota = cpu_max(cpus)?;
            self.write("cpu.max", &quota)
                .with_context(|| format!("Failed to set CPU limit to {}", cpus))?;
        }
        Ok(())
    }

    /// Moves a process (as seen from the caller's PID namespace) into this
    /// cgroup.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
            .with_context(|| format!("Failed to add process {} to cgroup", pid))
    }

    /// Removes `{base}/{id}` if it is still there. Only succeeds once every
    /// process in it has exited.
    pub fn remove(base: &Path, id: &str) -> Result<()> {
        let path = base.join(id);
        if path.exists() {
            // cgroupfs directories are removed with rmdir, never recursively
            fs::remove_dir(&path)
                .with_context(|| format!("Failed to remove cgroup {:?}", path))?;
            tracing::debug!(path = %path.display(), "cgroup removed");
        }
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let target = self.path.join(file);
        fs::write(&target, value).with_context(|| format!("Failed to write to {:?}", target))
    }
}

/// Makes sure `base` exists and its children may use the controllers.
fn ensure_base_cgroup(base: &Path) -> Result<()> {
    if !base.exists() {
        fs::create_dir_all(base)
            .with_context(|| format!("Failed to create base directory at {:?}", base))?;
    }

    // Enabling controllers fails harmlessly when they are already on or not
    // delegated to us; limits that then cannot be written still error out.
    if let Some(parent) = base.parent() {
        if let Err(e) = fs::write(parent.join("cgroup.subtree_control"), CONTROLLERS) {
            tracing::debug!(error = %e, "could not enable controllers on parent cgroup");
        }
    }
    if let Err(e) = fs::write(base.join("cgroup.subtree_control"), CONTROLLERS) {
        tracing::debug!(error = %e, "could not enable controllers on base cgroup");
    }
    Ok(())
}

/// Megabytes to bytes, for the flag named `flag`.
fn megabytes(value: u64, flag: &str) -> Result<u64> {
    value
        .checked_mul(MB)
        .with_context(|| format!("{}={} is too large", flag, value))
}

/// Converts a CPU fraction (e.g. 0.5) into a `cpu.max` value
/// ("quota period", e.g. "50000 100000").
fn cpu_max(cpus: f64) -> Result<String> {
    if !cpus.is_finite() || cpus <= 0.0 {
        anyhow::bail!("CPU quota must be greater than 0");
    }
    let quota = (cpus * CPU_PERIOD as f64) as u64;
    Ok(format!("{} {}", quota.max(1000), CPU_PERIOD))
}
