use std::fs;

use anyhow::Context;

use crate::config::Paths;
use crate::container::{ContainerId, ContainerLayout};
use crate::fs::unmount_overlay;
use crate::kernel::Kernel;
use crate::net;

/// Releases everything a container run left behind, in order:
/// network namespace handle, overlay mount, cgroup, container directories.
///
/// Every step looks at the current state first, so running it on a
/// half-started or already removed container is fine. Must only be called
/// once the namespaced child has exited.
pub fn teardown(kernel: &impl Kernel, paths: &Paths, id: &ContainerId) -> anyhow::Result<()> {
    let handle = paths.netns_handle(id.as_str());
    if kernel.is_mounted(&handle)? {
        kernel
            .unmount(&handle)
            .with_context(|| format!("unable to unmount network namespace at {:?}", handle))?;
        tracing::debug!(path = %handle.display(), "network namespace unmounted");
    }
    if handle.exists() {
        fs::remove_file(&handle).with_context(|| format!("failed to remove {:?}", handle))?;
    }
    // normally gone together with the namespace
    if let Err(e) = net::remove_host_veth(id) {
        tracing::warn!(%id, error = %format!("{:#}", e), "could not remove host veth");
    }

    let layout = ContainerLayout::new(paths, id);
    if kernel.is_mounted(&layout.mnt)? {
        unmount_overlay(kernel, &layout)?;
    }

    kernel.remove_cgroup(id.as_str())?;

    if layout.home.exists() {
        fs::remove_dir_all(&layout.home)
            .with_context(|| format!("failed to remove {:?}", layout.home))?;
    }

    tracing::info!(%id, "container torn down");
    Ok(())
}
