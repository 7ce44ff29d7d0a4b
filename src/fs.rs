use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use nix::mount::MsFlags;

use crate::container::ContainerLayout;
use crate::error::ImageError;
use crate::image::ImageStore;
use crate::kernel::{Kernel, MountSpec};

/// Everything needed to union-mount an image under a container.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayMount {
    /// Highest priority first: the newest image layer leads the list.
    pub lower: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayMount {
    pub fn options(&self) -> String {
        let lower: Vec<String> = self.lower.iter().map(|p| p.display().to_string()).collect();
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            self.upper.display(),
            self.work.display()
        )
    }

    fn spec(&self) -> MountSpec {
        MountSpec {
            source: Some("none".to_string()),
            target: self.merged.clone(),
            fstype: Some("overlay".to_string()),
            flags: MsFlags::empty(),
            data: Some(self.options()),
        }
    }
}

/// Lower directories of an image, newest layer first.
///
/// The store must hold exactly one manifest with at least one layer; more
/// than one manifest is refused rather than guessed at.
pub fn lower_dirs(store: &ImageStore, digest: &str) -> Result<Vec<PathBuf>, ImageError> {
    let manifests = store.manifest(digest)?;
    let first = match manifests.as_slice() {
        [] => return Err(ImageError::NoLayers(digest.to_string())),
        [only] => only,
        many => {
            return Err(ImageError::MultipleManifests {
                digest: digest.to_string(),
                count: many.len(),
            });
        }
    };
    if first.layers.is_empty() {
        return Err(ImageError::NoLayers(digest.to_string()));
    }

    let mut lower = Vec::with_capacity(first.layers.len());
    for layer in &first.layers {
        lower.insert(0, store.layer_path(digest, layer)?);
    }
    Ok(lower)
}

pub fn overlay_for(
    store: &ImageStore,
    layout: &ContainerLayout,
    digest: &str,
) -> Result<OverlayMount, ImageError> {
    Ok(OverlayMount {
        lower: lower_dirs(store, digest)?,
        upper: layout.upper.clone(),
        work: layout.work.clone(),
        merged: layout.mnt.clone(),
    })
}

/// Union-mounts the image at the container's `fs/mnt`.
pub fn mount_overlay(
    kernel: &impl Kernel,
    store: &ImageStore,
    layout: &ContainerLayout,
    digest: &str,
) -> anyhow::Result<()> {
    let overlay = overlay_for(store, layout, digest)?;
    if overlay.lower.is_empty() {
        bail!("refusing to mount an overlay without lower layers");
    }

    kernel.mount(&overlay.spec())?;
    tracing::info!(
        merged = %overlay.merged.display(),
        layers = overlay.lower.len(),
        "overlay mounted"
    );
    Ok(())
}

pub fn unmount_overlay(kernel: &impl Kernel, layout: &ContainerLayout) -> anyhow::Result<()> {
    kernel
        .unmount(&layout.mnt)
        .with_context(|| format!("unable to unmount container filesystem at {:?}", layout.mnt))?;
    tracing::info!(path = %layout.mnt.display(), "overlay unmounted");
    Ok(())
}

/// Copies the first host resolver file that exists to `etc/resolv.conf`
/// under `root`. Having none of them is fine; the container simply gets no
/// DNS configuration.
pub fn copy_nameserver_config(candidates: &[PathBuf], root: &Path) -> anyhow::Result<Option<PathBuf>> {
    let Some(source) = candidates.iter().find(|p| p.exists()) else {
        tracing::debug!("no host resolver configuration found");
        return Ok(None);
    };

    let etc = root.join("etc");
    if !etc.exists() {
        std::fs::create_dir_all(&etc).with_context(|| format!("failed to create {:?}", etc))?;
    }
    let target = etc.join("resolv.conf");
    // never write through a symlink shipped by the image
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(&target)
            .with_context(|| format!("failed to remove existing {:?}", target))?;
    }
    std::fs::copy(source, &target)
        .with_context(|| format!("failed to copy {:?} to {:?}", source, target))?;
    tracing::debug!(source = %source.display(), "resolver configuration copied");
    Ok(Some(source.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::container::ContainerId;
    use crate::kernel::recording::{Call, Recorder};

    fn fixture(manifest: &str) -> (tempfile::TempDir, Paths, ImageStore, ContainerLayout) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let image_dir = paths.images().join("img0");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join("manifest.json"), manifest).unwrap();
        let store = ImageStore::new(paths.images());
        let layout = ContainerLayout::new(&paths, &"c0ffee000001".parse::<ContainerId>().unwrap());
        (tmp, paths, store, layout)
    }

    #[test]
    fn test_lower_dirs_newest_first() {
        let (_tmp, paths, store, _) = fixture(
            r#"[{"Config": "img0.json", "Layers": [
                "111111111111aaaa/layer.tar",
                "222222222222bbbb/layer.tar",
                "333333333333cccc/layer.tar"
            ]}]"#,
        );
        let base = paths.images().join("img0");

        let lower = lower_dirs(&store, "img0").unwrap();
        assert_eq!(
            lower,
            vec![
                base.join("333333333333/fs"),
                base.join("222222222222/fs"),
                base.join("111111111111/fs"),
            ]
        );
    }

    #[test]
    fn test_mount_overlay_options() {
        let (_tmp, paths, store, layout) = fixture(
            r#"[{"Layers": ["111111111111aaaa/layer.tar", "222222222222bbbb/layer.tar"]}]"#,
        );
        let kernel = Recorder::default();
        mount_overlay(&kernel, &store, &layout, "img0").unwrap();

        let base = paths.images().join("img0");
        let expected = format!(
            "lowerdir={}:{},upperdir={},workdir={}",
            base.join("222222222222/fs").display(),
            base.join("111111111111/fs").display(),
            layout.upper.display(),
            layout.work.display()
        );
        match kernel.calls().as_slice() {
            [Call::Mount(spec)] => {
                assert_eq!(spec.target, layout.mnt);
                assert_eq!(spec.fstype.as_deref(), Some("overlay"));
                assert_eq!(spec.data.as_deref(), Some(expected.as_str()));
            }
            calls => panic!("unexpected calls {:?}", calls),
        }
    }

    #[test]
    fn test_rejects_empty_manifest() {
        for manifest in [r#"[]"#, r#"[{"Layers": []}]"#] {
            let (_tmp, _, store, layout) = fixture(manifest);
            let kernel = Recorder::default();
            let err = mount_overlay(&kernel, &store, &layout, "img0").unwrap_err();
            assert!(matches!(err.downcast_ref::<ImageError>(), Some(ImageError::NoLayers(_))));
            assert!(kernel.calls().is_empty());
        }
    }

    #[test]
    fn test_rejects_multiple_manifests() {
        let (_tmp, _, store, layout) = fixture(
            r#"[{"Layers": ["111111111111aaaa/layer.tar"]}, {"Layers": ["222222222222bbbb/layer.tar"]}]"#,
        );
        let kernel = Recorder::default();
        let err = mount_overlay(&kernel, &store, &layout, "img0").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::MultipleManifests { count: 2, .. })
        ));
        assert!(kernel.calls().is_empty());
    }

    #[test]
    fn test_unmount_targets_mount_point() {
        let (_tmp, _, store, layout) = fixture(r#"[{"Layers": ["111111111111aaaa/layer.tar"]}]"#);
        let kernel = Recorder::default();
        mount_overlay(&kernel, &store, &layout, "img0").unwrap();
        unmount_overlay(&kernel, &layout).unwrap();

        let calls = kernel.calls();
        let Call::Mount(spec) = &calls[0] else {
            panic!("expected a mount first");
        };
        assert_eq!(calls[1], Call::Unmount(spec.target.clone()));
        assert!(unmount_overlay(&kernel, &layout).is_err());
    }

    #[test]
    fn test_resolver_uses_first_present_candidate() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let host = tmp.path().join("host");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(host.join("resolv.conf"), "nameserver 10.0.0.53\n").unwrap();
        let root = tmp.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();

        let copied = copy_nameserver_config(&paths.resolv_candidates, &root).unwrap();
        assert_eq!(copied, Some(host.join("resolv.conf")));
        assert_eq!(
            std::fs::read_to_string(root.join("etc/resolv.conf")).unwrap(),
            "nameserver 10.0.0.53\n"
        );

        std::fs::write(host.join("systemd-resolv.conf"), "nameserver 127.0.0.53\n").unwrap();
        let copied = copy_nameserver_config(&paths.resolv_candidates, &root).unwrap();
        assert_eq!(copied, Some(host.join("systemd-resolv.conf")));
    }

    #[test]
    fn test_resolver_replaces_symlink_in_image() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let host = tmp.path().join("host");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(host.join("resolv.conf"), "nameserver 9.9.9.9\n").unwrap();
        let outside = tmp.path().join("host-file");
        std::fs::write(&outside, "host data\n").unwrap();
        let root = tmp.path().join("rootfs");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("etc/resolv.conf")).unwrap();

        copy_nameserver_config(&paths.resolv_candidates, &root).unwrap();

        assert_eq!(std::fs::read_to_string(&outside).unwrap(), "host data\n");
        let target = root.join("etc/resolv.conf");
        assert!(target.symlink_metadata().unwrap().file_type().is_file());
        assert_eq!(std::fs::read_to_string(target).unwrap(), "nameserver 9.9.9.9\n");
    }

    #[test]
    fn test_resolver_without_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::sandboxed(tmp.path());
        let root = tmp.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();

        assert_eq!(copy_nameserver_config(&paths.resolv_candidates, &root).unwrap(), None);
        assert!(!root.join("etc").exists());
    }
}
