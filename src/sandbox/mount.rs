//! Mount controller: decides how a host directory appears inside the sandbox.
//!
//! Read-write mounts are plain bind mappings at `/workdir/<name>`. Read-only
//! mounts bind the host directory read-only at `/ro/<name>` and present an
//! overlay at `/workdir/<name>` whose upper layer lives on a tmpfs owned by the
//! container, so every write disappears with the container.

use super::error::{Result, SandboxError};
use super::shell::shell_quote;
use super::types::Permission;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory inside the container where mounts are presented to the model.
pub const WORKDIR: &str = "/workdir";
/// Directory inside the container where read-only sources are bound.
pub const READ_ONLY_ROOT: &str = "/ro";
/// tmpfs holding overlay upper/work dirs; overlayfs refuses an upper layer on overlayfs.
pub const OVERLAY_SCRATCH: &str = "/.overlay-scratch";

/// How read-only mounts get a writable view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadOnlyStrategy {
    /// Kernel overlay mount, falling back to a snapshot copy if refused.
    #[default]
    Overlay,
    /// Always copy the read-only source into the container layer.
    Copy,
}

/// In-container layout for a read-only view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayPlan {
    pub lower: String,
    pub upper: String,
    pub work: String,
    pub merged: String,
    pub strategy: ReadOnlyStrategy,
}

impl OverlayPlan {
    /// Script that mounts the overlay at `merged`.
    pub fn mount_script(&self) -> Result<String> {
        Ok(format!(
            "mkdir -p {merged} {upper} {work} && mount -t overlay overlay -o lowerdir={lower},upperdir={upper},workdir={work} {merged}",
            merged = shell_quote(&self.merged)?,
            upper = shell_quote(&self.upper)?,
            work = shell_quote(&self.work)?,
            lower = shell_quote(&self.lower)?,
        ))
    }

    /// Fallback: snapshot the lower layer into `merged`.
    pub fn copy_script(&self) -> Result<String> {
        Ok(format!(
            "mkdir -p {merged} && cp -a {lower}/. {merged}/",
            merged = shell_quote(&self.merged)?,
            lower = shell_quote(&self.lower)?,
        ))
    }
}

/// Filesystem view requested for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Canonical host path.
    pub source: PathBuf,
    /// Path the model sees inside the container.
    pub target: String,
    pub permission: Permission,
    overlay: Option<OverlayPlan>,
}

impl MountSpec {
    /// Docker `binds` entries for this mount.
    pub fn binds(&self) -> Vec<String> {
        let source = self.source.display();
        match &self.overlay {
            Some(plan) => vec![format!("{}:{}:ro", source, plan.lower)],
            None => vec![format!("{}:{}:{}", source, self.target, self.permission.bind_mode())],
        }
    }

    /// Present only for read-only mounts.
    pub fn overlay(&self) -> Option<&OverlayPlan> {
        self.overlay.as_ref()
    }

    /// tmpfs mount point the container needs for overlay scratch space.
    pub fn scratch_tmpfs(&self) -> Option<&'static str> {
        if self.needs_mount_capability() {
            Some(OVERLAY_SCRATCH)
        } else {
            None
        }
    }

    /// Whether the container needs `CAP_SYS_ADMIN` to build the view.
    pub fn needs_mount_capability(&self) -> bool {
        matches!(
            self.overlay,
            Some(OverlayPlan {
                strategy: ReadOnlyStrategy::Overlay,
                ..
            })
        )
    }
}

/// Validates mount requests against a caller-approved root.
#[derive(Debug, Clone)]
pub struct MountController {
    approved_root: PathBuf,
    read_only_strategy: ReadOnlyStrategy,
}

impl MountController {
    /// The root must exist; it is canonicalized once here.
    pub fn new(approved_root: impl AsRef<Path>) -> Result<Self> {
        let root = approved_root.as_ref();
        let approved_root = std::fs::canonicalize(root).map_err(|e| {
            SandboxError::Configuration(format!(
                "approved root {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            approved_root,
            read_only_strategy: ReadOnlyStrategy::default(),
        })
    }

    pub fn with_read_only_strategy(mut self, strategy: ReadOnlyStrategy) -> Self {
        self.read_only_strategy = strategy;
        self
    }

    pub fn approved_root(&self) -> &Path {
        &self.approved_root
    }

    /// Canonicalize `source` (file or directory) and check it lies under the approved root.
    pub fn resolve(&self, source: impl AsRef<Path>) -> Result<PathBuf> {
        let source = source.as_ref();
        let canonical = std::fs::canonicalize(source).map_err(|e| {
            SandboxError::Configuration(format!(
                "mount source {} does not exist: {}",
                source.display(),
                e
            ))
        })?;
        if !canonical.starts_with(&self.approved_root) {
            return Err(SandboxError::Permission(format!(
                "{} is outside the approved root {}",
                canonical.display(),
                self.approved_root.display()
            )));
        }
        Ok(canonical)
    }

    /// Compute the mount spec for `source` under `permission`.
    pub fn plan(&self, source: impl AsRef<Path>, permission: Permission) -> Result<MountSpec> {
        let canonical = self.resolve(source)?;
        if !canonical.is_dir() {
            return Err(SandboxError::Configuration(format!(
                "mount source {} is not a directory",
                canonical.display()
            )));
        }

        let name = mount_name(&canonical)?;
        let target = format!("{}/{}", WORKDIR, name);
        let overlay = match permission {
            Permission::ReadWrite => None,
            Permission::ReadOnly => Some(OverlayPlan {
                lower: format!("{}/{}", READ_ONLY_ROOT, name),
                upper: format!("{}/{}/upper", OVERLAY_SCRATCH, name),
                work: format!("{}/{}/work", OVERLAY_SCRATCH, name),
                merged: target.clone(),
                strategy: self.read_only_strategy,
            }),
        };

        debug!(
            source = %canonical.display(),
            target = %target,
            permission = %permission,
            "Planned mount"
        );

        Ok(MountSpec {
            source: canonical,
            target,
            permission,
            overlay,
        })
    }
}

fn mount_name(canonical: &Path) -> Result<String> {
    let name = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("mount")
        .to_string();
    // ':' would split the docker bind spec.
    let full = canonical.to_string_lossy();
    if full.contains(':') || full.contains('\n') {
        return Err(SandboxError::Configuration(format!(
            "mount source '{}' contains characters not allowed in a bind mount",
            full
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_is_a_direct_bind() {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("project");
        std::fs::create_dir(&project).unwrap();

        let ctl = MountController::new(root.path()).unwrap();
        let spec = ctl.plan(&project, Permission::ReadWrite).unwrap();

        assert_eq!(spec.target, "/workdir/project");
        assert!(spec.overlay().is_none());
        let binds = spec.binds();
        assert_eq!(binds.len(), 1);
        assert!(binds[0].ends_with(":/workdir/project:rw"));
        assert!(!spec.needs_mount_capability());
    }

    #[test]
    fn read_only_binds_lower_layer_read_only() {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("project");
        std::fs::create_dir(&project).unwrap();

        let ctl = MountController::new(root.path()).unwrap();
        let spec = ctl.plan(&project, Permission::ReadOnly).unwrap();

        assert_eq!(spec.target, "/workdir/project");
        assert!(spec.binds()[0].ends_with(":/ro/project:ro"));
        let plan = spec.overlay().unwrap();
        assert_eq!(plan.merged, "/workdir/project");
        assert!(plan.upper.starts_with("/.overlay-scratch/project"));
        assert_eq!(spec.scratch_tmpfs(), Some(OVERLAY_SCRATCH));
        assert!(plan.mount_script().unwrap().contains("lowerdir=/ro/project"));
        assert!(spec.needs_mount_capability());
    }

    #[test]
    fn copy_strategy_needs_no_capability() {
        let root = tempfile::tempdir().unwrap();
        let ctl = MountController::new(root.path())
            .unwrap()
            .with_read_only_strategy(ReadOnlyStrategy::Copy);
        let spec = ctl.plan(root.path(), Permission::ReadOnly).unwrap();
        assert!(!spec.needs_mount_capability());
        assert!(spec.overlay().unwrap().copy_script().unwrap().starts_with("mkdir -p"));
    }

    #[test]
    fn missing_source_is_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let ctl = MountController::new(root.path()).unwrap();
        let err = ctl
            .plan(root.path().join("nope"), Permission::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
    }

    #[test]
    fn file_source_is_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let ctl = MountController::new(root.path()).unwrap();
        let err = ctl.plan(&file, Permission::ReadWrite).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
    }

    #[test]
    fn traversal_outside_root_is_permission_error() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("approved");
        let sibling = outer.path().join("secret");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&sibling).unwrap();

        let ctl = MountController::new(&root).unwrap();
        let err = ctl
            .plan(root.join("..").join("secret"), Permission::ReadWrite)
            .unwrap_err();
        assert!(matches!(err, SandboxError::Permission(_)));
    }

    #[test]
    fn resolve_accepts_files_inside_root_only() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("approved");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();
        std::fs::write(outer.path().join("secret.txt"), "x").unwrap();

        let ctl = MountController::new(&root).unwrap();
        assert!(ctl.resolve(root.join("notes.txt")).unwrap().ends_with("notes.txt"));
        assert!(matches!(
            ctl.resolve(outer.path().join("secret.txt")),
            Err(SandboxError::Permission(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_permission_error() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("approved");
        let sibling = outer.path().join("secret");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&sibling).unwrap();
        std::os::unix::fs::symlink(&sibling, root.join("link")).unwrap();

        let ctl = MountController::new(&root).unwrap();
        let err = ctl.plan(root.join("link"), Permission::ReadOnly).unwrap_err();
        assert!(matches!(err, SandboxError::Permission(_)));
    }
}
