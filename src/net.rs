use std::fs::{self, File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, bail};
use cidr::Ipv4Cidr;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns, unshare};

use crate::config::Paths;
use crate::container::ContainerId;

const BRIDGE_NAME: &str = "rocker0";
const NETWORK: &str = "172.29.0.0/16";
const SYS_CLASS_NET: &str = "/sys/class/net";

/// executes ip command with arguments
fn ip(args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new("/sbin/ip")
        .args(args)
        .status()
        .with_context(|| format!("Failed to execute ip {:?}", args))?;
    if !status.success() {
        bail!("ip {:?} exited with {}", args, status);
    }
    Ok(())
}

fn network() -> anyhow::Result<Ipv4Cidr> {
    NETWORK.parse().context("parse container network")
}

fn link_exists(name: &str) -> bool {
    Path::new(SYS_CLASS_NET).join(name).exists()
}

/// The bridge takes the first address of the network.
fn bridge_address(netw: &Ipv4Cidr) -> anyhow::Result<Ipv4Addr> {
    Ok(netw.iter().nth(1).context("get bridge address from cidr")?.address())
}

/// Picks the container's address from its id. Host numbers 0, 1 and the
/// broadcast address are never handed out.
pub fn container_address(netw: &Ipv4Cidr, id: &ContainerId) -> anyhow::Result<Ipv4Addr> {
    let usable = (1u64 << (32 - netw.network_length())).saturating_sub(3);
    if usable == 0 {
        bail!("network {} has no room for containers", netw);
    }
    let seed = id
        .as_str()
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
    let host = 2 + seed % usable;
    let base = u32::from(netw.first_address());
    Ok(Ipv4Addr::from(base + host as u32))
}

/// Host and container ends of the veth pair of a container.
pub fn veth_names(id: &ContainerId) -> (String, String) {
    let short: String = id.as_str().chars().take(6).collect();
    (format!("veth0_{}", short), format!("veth1_{}", short))
}

/// creates the bridge with the given IP address unless it is already there
fn ensure_bridge(netw: &Ipv4Cidr) -> anyhow::Result<()> {
    if link_exists(BRIDGE_NAME) {
        return Ok(());
    }
    let addr = format!("{}/{}", bridge_address(netw)?, netw.network_length());
    ip(&["link", "add", "name", BRIDGE_NAME, "type", "bridge"]).context("creating bridge")?;
    ip(&["addr", "add", &addr, "dev", BRIDGE_NAME]).context("adding IP address to bridge")?;
    ip(&["link", "set", "dev", BRIDGE_NAME, "up"]).context("bringing up bridge")?;
    tracing::info!(bridge = BRIDGE_NAME, %addr, "bridge created");
    Ok(())
}

/// setup the network on the host side:
/// - create the bridge if this is the first container
/// - create the veth pair for this container
/// - attach the host end to the bridge and bring it up
pub fn setup_host(id: &ContainerId) -> anyhow::Result<()> {
    let netw = network()?;
    ensure_bridge(&netw)?;

    let (host, peer) = veth_names(id);
    ip(&["link", "add", "name", &host, "type", "veth", "peer", "name", &peer])
        .context("creating veth pair")?;
    ip(&["link", "set", "dev", &host, "master", BRIDGE_NAME])
        .context("attaching host side to the bridge")?;
    ip(&["link", "set", "dev", &host, "up"]).context("bringing up host side")?;

    tracing::info!(%id, veth = %host, "host network ready");
    Ok(())
}

/// Creates a network namespace and pins it to `{netns}/{id}` with a bind
/// mount, so it outlives this process.
///
/// Runs as its own process (`setup-netns`): afterwards the caller is left
/// inside the new namespace.
pub fn create_netns(paths: &Paths, id: &ContainerId) -> anyhow::Result<()> {
    fs::create_dir_all(&paths.netns)
        .with_context(|| format!("failed to create {:?}", paths.netns))?;

    let handle = paths.netns_handle(id.as_str());
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&handle)
        .with_context(|| format!("failed to create namespace handle {:?}", handle))?;

    unshare(CloneFlags::CLONE_NEWNET).context("unshare network namespace")?;
    mount(
        Some("/proc/self/ns/net"),
        &handle,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind mount namespace to {:?}", handle))?;

    tracing::info!(%id, handle = %handle.display(), "network namespace created");
    Ok(())
}

/// Moves the container end of the veth pair into the container's namespace
/// and configures it there:
/// - address derived from the container id
/// - interface up
/// - default route via the bridge
///
/// Runs as its own process (`setup-veth`).
pub fn attach_veth(paths: &Paths, id: &ContainerId) -> anyhow::Result<()> {
    let netw = network()?;
    let gateway = bridge_address(&netw)?;
    let addr = format!("{}/{}", container_address(&netw, id)?, netw.network_length());
    let (_, peer) = veth_names(id);

    let handle = paths.netns_handle(id.as_str());
    let handle_arg = handle.to_string_lossy();
    // ip treats a netns argument containing '/' as a path to the handle
    ip(&["link", "set", "dev", &peer, "netns", &handle_arg])
        .context("moving container veth into its namespace")?;

    let ns = File::open(&handle).with_context(|| format!("failed to open {:?}", handle))?;
    setns(&ns, CloneFlags::CLONE_NEWNET).context("join container network namespace")?;

    ip(&["addr", "add", &addr, "dev", &peer]).context("adding IP address to container veth")?;
    ip(&["link", "set", "dev", &peer, "up"]).context("bringing up container veth side")?;
    ip(&["route", "add", "default", "via", &gateway.to_string(), "dev", &peer])
        .context("configure default route")?;

    tracing::info!(%id, %addr, "container network attached");
    Ok(())
}

/// Deletes the host end of the veth pair if it outlived the namespace.
pub fn remove_host_veth(id: &ContainerId) -> anyhow::Result<()> {
    let (host, _) = veth_names(id);
    if link_exists(&host) {
        ip(&["link", "delete", &host]).context("removing host veth")?;
    }
    Ok(())
}
