//! Child mode: runs as PID 1 of the fresh namespaces, prepares the
//! container and runs the user command in it.

use std::path::Path;

use crate::config::Paths;
use crate::container::ContainerLayout;
use crate::error::{Step, StepError, StepExt};
use crate::fs::copy_nameserver_config;
use crate::image::ImageStore;
use crate::kernel::{Kernel, MountSpec, Workload};
use crate::launch::NamespaceParams;

/// Pseudo filesystems in mount order. `/dev/pts` must come after the tmpfs
/// on `/dev` that hosts it.
const PSEUDO_MOUNTS: [(&str, &str); 5] = [
    ("proc", "/proc"),
    ("tmpfs", "/tmp"),
    ("tmpfs", "/dev"),
    ("devpts", "/dev/pts"),
    ("sysfs", "/sys"),
];

/// Unmount order: `/dev/pts` and `/dev` first, since `/dev/pts` lives on
/// the `/dev` tmpfs.
const PSEUDO_UNMOUNTS: [&str; 5] = ["/dev/pts", "/dev", "/sys", "/proc", "/tmp"];

pub fn initialize(
    kernel: &impl Kernel,
    paths: &Paths,
    params: &NamespaceParams,
) -> Result<(), StepError> {
    let id = &params.container_id;
    let layout = ContainerLayout::new(paths, id);
    let store = ImageStore::new(paths.images());

    let (program, args) = params
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))
        .step(Step::Workload)?;
    let workload = Workload {
        program: program.clone(),
        args: args.to_vec(),
        env: store.environment(&params.image_digest).step(Step::Workload)?,
        drop_caps: params.drop_caps,
    };

    // keep everything mounted from here on out of the host's mount table
    kernel.mount(&MountSpec::private("/")).step(Step::MountPseudoFs)?;

    kernel.set_hostname(id.as_str()).step(Step::Hostname)?;
    kernel
        .join_netns(&paths.netns_handle(id.as_str()))
        .step(Step::JoinNetns)?;
    kernel
        .apply_cgroup(id.as_str(), &params.limits)
        .step(Step::Cgroups)?;
    copy_nameserver_config(&paths.resolv_candidates, &layout.mnt).step(Step::ResolverConfig)?;
    kernel.chroot(&layout.mnt).step(Step::Chroot)?;

    mount_pseudo_filesystems(kernel).step(Step::MountPseudoFs)?;
    kernel.loopback_up().step(Step::Loopback)?;

    tracing::info!(%id, command = ?params.command, "starting workload");
    match kernel.exec(&workload) {
        Ok(status) if status.success() => tracing::info!(%id, "workload finished"),
        Ok(status) => tracing::warn!(%id, %status, "workload failed"),
        Err(e) => tracing::error!(%id, error = %format!("{:#}", e), "workload could not be started"),
    }

    unmount_pseudo_filesystems(kernel).step(Step::UnmountPseudoFs)
}

fn mount_pseudo_filesystems(kernel: &impl Kernel) -> anyhow::Result<()> {
    kernel.create_dirs(&[Path::new("/proc"), Path::new("/sys")])?;
    for (fstype, target) in PSEUDO_MOUNTS {
        if target == "/dev/pts" {
            kernel.create_dirs(&[Path::new(target)])?;
        }
        kernel.mount(&MountSpec::pseudo(fstype, target))?;
    }
    Ok(())
}

/// Stops at the first failure, leaving the remaining filesystems mounted;
/// they go away with the mount namespace once this process exits.
fn unmount_pseudo_filesystems(kernel: &impl Kernel) -> anyhow::Result<()> {
    for target in PSEUDO_UNMOUNTS {
        kernel.unmount(Path::new(target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::*;
    use crate::Cli;
    use crate::kernel::recording::{Call, Recorder};

    fn params(argv: &[&str]) -> NamespaceParams {
        let cli = Cli::try_parse_from(std::iter::once("rocker").chain(argv.iter().copied())).unwrap();
        match cli.command {
            crate::Commands::ChildMode(params) => params,
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn sandbox() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let image = paths.images().join("abcd1234");
        std::fs::create_dir_all(&image).unwrap();
        std::fs::write(image.join("abcd1234.json"), r#"{"config": {"Env": ["PATH=/bin", "HOME=/root"]}}"#).unwrap();
        (tmp, paths)
    }

    #[test]
    fn test_steps_run_in_order() {
        let (_tmp, paths) = sandbox();
        let kernel = Recorder::default();
        let params = params(&["child-mode", "--mem=512", "--img=abcd1234", "cid123", "echo", "hi"]);

        initialize(&kernel, &paths, &params).unwrap();

        let layout = ContainerLayout::new(&paths, &params.container_id);
        let calls = kernel.calls();
        assert_eq!(calls[0], Call::Mount(MountSpec::private("/")));
        assert_eq!(calls[1], Call::Hostname("cid123".to_string()));
        assert_eq!(calls[2], Call::JoinNetns(paths.netns_handle("cid123")));
        assert_eq!(calls[3], Call::Cgroup("cid123".to_string(), params.limits.clone()));
        assert_eq!(calls[4], Call::Chroot(layout.mnt.clone()));
        assert_eq!(
            calls[5],
            Call::CreateDirs(vec![PathBuf::from("/proc"), PathBuf::from("/sys")])
        );

        let exec = calls.iter().position(|c| matches!(c, Call::Exec(_))).unwrap();
        assert_eq!(calls[exec - 1], Call::Loopback);
        assert_eq!(
            calls[exec],
            Call::Exec(Workload {
                program: "echo".to_string(),
                args: vec!["hi".to_string()],
                env: vec![
                    ("PATH".to_string(), "/bin".to_string()),
                    ("HOME".to_string(), "/root".to_string()),
                ],
                drop_caps: false,
            })
        );
    }

    #[test]
    fn test_unmounts_reverse_mount_order() {
        let (_tmp, paths) = sandbox();
        let kernel = Recorder::default();
        let params = params(&["child-mode", "--img=abcd1234", "cid123", "true"]);

        initialize(&kernel, &paths, &params).unwrap();

        let trace = kernel.mount_trace();
        assert_eq!(
            trace,
            vec![
                "mount /proc",
                "mount /tmp",
                "mount /dev",
                "mount /dev/pts",
                "mount /sys",
                "umount /dev/pts",
                "umount /dev",
                "umount /sys",
                "umount /proc",
                "umount /tmp",
            ]
        );
        assert!(kernel.mounted.borrow().is_empty());
    }

    #[test]
    fn test_failed_workload_still_unmounts() {
        let (_tmp, paths) = sandbox();
        let kernel = Recorder {
            exit_code: 3,
            ..Default::default()
        };
        let params = params(&["child-mode", "--img=abcd1234", "cid123", "false"]);

        initialize(&kernel, &paths, &params).unwrap();
        assert!(kernel.mounted.borrow().is_empty());
        assert_eq!(
            kernel.calls().last(),
            Some(&Call::Unmount(PathBuf::from("/tmp")))
        );
    }

    #[test]
    fn test_mount_failure_stops_before_workload() {
        let (_tmp, paths) = sandbox();
        let kernel = Recorder {
            fail_mount_of: Some(PathBuf::from("/dev")),
            ..Default::default()
        };
        let params = params(&["child-mode", "--img=abcd1234", "cid123", "true"]);

        let err = initialize(&kernel, &paths, &params).unwrap_err();
        assert_eq!(err.step, Step::MountPseudoFs);
        assert!(!kernel.calls().iter().any(|c| matches!(c, Call::Exec(_) | Call::Unmount(_))));
    }

    #[test]
    fn test_copies_resolver_before_chroot() {
        let (tmp, paths) = sandbox();
        std::fs::create_dir_all(tmp.path().join("host")).unwrap();
        std::fs::write(tmp.path().join("host/resolv.conf"), "nameserver 1.1.1.1\n").unwrap();
        let kernel = Recorder::default();
        let params = params(&["child-mode", "--img=abcd1234", "cid123", "true"]);

        initialize(&kernel, &paths, &params).unwrap();

        let layout = ContainerLayout::new(&paths, &params.container_id);
        assert_eq!(
            std::fs::read_to_string(layout.mnt.join("etc/resolv.conf")).unwrap(),
            "nameserver 1.1.1.1\n"
        );
    }
}
