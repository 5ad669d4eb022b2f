//! Ephemeral execution workspaces.
//!
//! One workspace per pipeline invocation, never shared, never reused. The
//! directory name carries a v4 uuid so concurrent invocations cannot collide;
//! wall-clock-derived names would.

use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::PipelineError;

/// Script file name inside a workspace.
const SCRIPT_FILE: &str = "script.py";
/// Artifact file name the capture epilogue writes to.
const ARTIFACT_FILE: &str = "output.png";

/// An exclusively-owned directory scope for one execution. Dropping an
/// unreleased workspace still removes it, so early error returns and timeouts
/// cannot leak files.
#[derive(Debug)]
pub struct Workspace {
    pub id: Uuid,
    dir: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn create(root: &Path) -> Result<Self, PipelineError> {
        let id = Uuid::new_v4();
        let dir = root.join(format!("ws-{}", id));
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::Resource(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self { id, dir, released: false })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join(SCRIPT_FILE)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(ARTIFACT_FILE)
    }

    /// Delete the workspace tree. Best-effort: a failure is logged, never
    /// escalated — identifiers are not reused, so leftovers are garbage, not
    /// a correctness hazard.
    pub fn release(mut self) {
        self.remove();
        self.released = true;
    }

    fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace = %self.id, dir = %self.dir.display(), error = %e, "workspace cleanup failed");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            self.remove();
        }
    }
}
