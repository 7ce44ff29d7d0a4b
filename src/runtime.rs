use std::path::Path;

use crate::config::Paths;
use crate::container::{ContainerId, ContainerLayout, ResourceLimits};
use crate::error::{Step, StepError, StepExt};
use crate::fs::mount_overlay;
use crate::image::ImageStore;
use crate::kernel::Kernel;
use crate::launch::{self, NamespaceParams};
use crate::net;
use crate::teardown::teardown;

/// What the user asked to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub limits: ResourceLimits,
    pub command: Vec<String>,
    pub drop_caps: bool,
}

/// Steps of a run that spawn processes or drive `ip` on the host.
pub trait Processes {
    fn setup_host(&self, id: &ContainerId) -> anyhow::Result<()>;
    /// Runs one of the hidden `setup-*` subcommands and waits for it.
    fn run_helper(&self, subcommand: &str, id: &ContainerId) -> anyhow::Result<()>;
    /// Runs the namespaced child to completion.
    fn launch(&self, params: &NamespaceParams) -> anyhow::Result<()>;
}

/// Re-executes this binary, rooted at `root`.
pub struct SelfExec<'a> {
    root: &'a Path,
}

impl<'a> SelfExec<'a> {
    pub fn new(root: &'a Path) -> Self {
        SelfExec { root }
    }
}

impl Processes for SelfExec<'_> {
    fn setup_host(&self, id: &ContainerId) -> anyhow::Result<()> {
        net::setup_host(id)
    }

    fn run_helper(&self, subcommand: &str, id: &ContainerId) -> anyhow::Result<()> {
        launch::run_helper(self.root, subcommand, id)
    }

    fn launch(&self, params: &NamespaceParams) -> anyhow::Result<()> {
        launch::launch(self.root, params)
    }
}

/// Runs one container to completion: prepare the filesystem and network,
/// start the namespaced child, wait for it, tear everything down.
///
/// Once the container directories exist, a failure in any later step still
/// runs teardown before the error is returned.
pub fn run(
    kernel: &impl Kernel,
    processes: &impl Processes,
    paths: &Paths,
    request: RunRequest,
) -> Result<(), StepError> {
    let store = ImageStore::new(paths.images());

    let id = ContainerId::generate();
    tracing::info!(%id, "new container");

    let digest = store.resolve(&request.image).step(Step::ResolveImage)?;
    tracing::info!(%id, image = %request.image, %digest, "image resolved");

    let layout = ContainerLayout::new(paths, &id);
    layout.create_dirs().step(Step::CreateDirectories)?;

    let params = NamespaceParams {
        limits: request.limits.normalized(),
        image_digest: digest,
        drop_caps: request.drop_caps,
        container_id: id.clone(),
        command: request.command,
    };
    let started = start(kernel, processes, &store, &layout, &params);

    let cleaned = teardown(kernel, paths, &id).step(Step::Teardown);
    match (started, cleaned) {
        (Err(e), Err(cleanup)) => {
            tracing::error!(%id, error = %format!("{:#}", anyhow::Error::new(cleanup)), "teardown after failure also failed");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => {
            tracing::info!(%id, "container done");
            Ok(())
        }
    }
}

fn start(
    kernel: &impl Kernel,
    processes: &impl Processes,
    store: &ImageStore,
    layout: &ContainerLayout,
    params: &NamespaceParams,
) -> Result<(), StepError> {
    let id = &params.container_id;

    mount_overlay(kernel, store, layout, &params.image_digest).step(Step::MountOverlay)?;
    processes.setup_host(id).step(Step::HostNetwork)?;
    processes.run_helper("setup-netns", id).step(Step::CreateNetns)?;
    processes.run_helper("setup-veth", id).step(Step::AttachVeth)?;

    processes.launch(params).step(Step::Launch)
}
