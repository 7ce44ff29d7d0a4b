use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A lifecycle step of a container run. Every failure is tagged with the
/// step that produced it so the operator knows how far the run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateDirectories,
    ResolveImage,
    MountOverlay,
    HostNetwork,
    CreateNetns,
    AttachVeth,
    Launch,
    Hostname,
    JoinNetns,
    Cgroups,
    ResolverConfig,
    Chroot,
    MountPseudoFs,
    Loopback,
    Workload,
    UnmountPseudoFs,
    Teardown,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::CreateDirectories => "create container directories",
            Step::ResolveImage => "resolve image",
            Step::MountOverlay => "mount overlay filesystem",
            Step::HostNetwork => "set up host network",
            Step::CreateNetns => "create network namespace",
            Step::AttachVeth => "attach veth to network namespace",
            Step::Launch => "launch namespaced child",
            Step::Hostname => "set hostname",
            Step::JoinNetns => "join network namespace",
            Step::Cgroups => "configure cgroups",
            Step::ResolverConfig => "copy resolver configuration",
            Step::Chroot => "chroot into container filesystem",
            Step::MountPseudoFs => "mount pseudo filesystems",
            Step::Loopback => "bring up loopback interface",
            Step::Workload => "run workload",
            Step::UnmountPseudoFs => "unmount pseudo filesystems",
            Step::Teardown => "tear down container",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{step} failed")]
pub struct StepError {
    pub step: Step,
    #[source]
    pub source: anyhow::Error,
}

/// Tags any error with the lifecycle step it happened in.
pub trait StepExt<T> {
    fn step(self, step: Step) -> Result<T, StepError>;
}

impl<T, E> StepExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn step(self, step: Step) -> Result<T, StepError> {
        self.map_err(|e| StepError {
            step,
            source: e.into(),
        })
    }
}

/// Failures while turning an image reference into something mountable.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("image '{0}' is not available locally")]
    NotFound(String),

    #[error("could not find any layers for image {0}")]
    NoLayers(String),

    #[error("image {digest} has {count} manifests, refusing to pick one")]
    MultipleManifests { digest: String, count: usize },

    #[error("layer entry '{0}' is too short to name a layer directory")]
    BadLayer(String),

    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
