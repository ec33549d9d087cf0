//! casegrid-replicate: package model state into transferable bundles.
//!
//! A bundle is a versioned snapshot of a model, staged once per run and
//! shipped to every server that does not already hold it.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use casegrid_alloc::{Server, ServerError};
use casegrid_core::{Model, ModelError, ResourceRequirements};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("failed to snapshot model: {0}")]
    Snapshot(#[from] ModelError),

    #[error("bundle I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle {id} is corrupt: expected sha256 {expected}, found {actual}")]
    Corrupt {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("transfer of {id} to {server} failed: {source}")]
    Transfer {
        id: String,
        server: String,
        #[source]
        source: ServerError,
    },
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// A packaged model snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Unique id: `<name>-<version>-<sha256 prefix>`.
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    /// What a server needs in order to load this bundle.
    pub requirements: ResourceRequirements,
}

/// Packages models into bundles and moves bundles to servers.
pub trait ModelReplicator: Send + Sync {
    fn package(&self, name: &str, version: &str, model: &dyn Model) -> ReplicationResult<Bundle>;

    /// Ship `bundle` to `server`.
    fn transfer(&self, bundle: &Bundle, server: &mut dyn Server) -> ReplicationResult<()>;

    /// Remove a bundle from storage. Removing a missing bundle is not an error.
    fn remove(&self, bundle: &Bundle) -> ReplicationResult<()>;
}

/// Stages bundles as files under a directory.
#[derive(Debug, Clone)]
pub struct FileReplicator {
    staging_dir: PathBuf,
}

impl FileReplicator {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }
}

impl ModelReplicator for FileReplicator {
    fn package(&self, name: &str, version: &str, model: &dyn Model) -> ReplicationResult<Bundle> {
        let payload = model.snapshot()?;
        let sha256 = sha256_hex(&payload);

        std::fs::create_dir_all(&self.staging_dir).map_err(|source| ReplicationError::Io {
            path: self.staging_dir.clone(),
            source,
        })?;
        let path = self.staging_dir.join(format!("{name}-{version}.bundle"));
        std::fs::write(&path, &payload).map_err(|source| ReplicationError::Io {
            path: path.clone(),
            source,
        })?;

        let bundle = Bundle {
            id: format!("{name}-{version}-{}", &sha256[..12]),
            name: name.to_string(),
            version: version.to_string(),
            path,
            sha256,
            size_bytes: payload.len() as u64,
            requirements: ResourceRequirements::for_model(model.kind()),
        };
        info!(bundle = %bundle.id, bytes = bundle.size_bytes, "model packaged");
        Ok(bundle)
    }

    fn transfer(&self, bundle: &Bundle, server: &mut dyn Server) -> ReplicationResult<()> {
        let payload = std::fs::read(&bundle.path).map_err(|source| ReplicationError::Io {
            path: bundle.path.clone(),
            source,
        })?;
        let actual = sha256_hex(&payload);
        if actual != bundle.sha256 {
            return Err(ReplicationError::Corrupt {
                id: bundle.id.clone(),
                expected: bundle.sha256.clone(),
                actual,
            });
        }

        server
            .receive_bundle(&bundle.id, &payload)
            .map_err(|source| ReplicationError::Transfer {
                id: bundle.id.clone(),
                server: server.info().name.clone(),
                source,
            })?;
        debug!(bundle = %bundle.id, server = %server.info().name, "bundle transferred");
        Ok(())
    }

    fn remove(&self, bundle: &Bundle) -> ReplicationResult<()> {
        match std::fs::remove_file(&bundle.path) {
            Ok(()) => {
                debug!(bundle = %bundle.id, "bundle removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ReplicationError::Io {
                path: bundle.path.clone(),
                source,
            }),
        }
    }
}

/// SHA-256 of `bytes` as a hex digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use casegrid_alloc::{LocalAllocator, ResourceAllocator};
    use casegrid_core::Paraboloid;
    use casegrid_core::paraboloid::KIND;

    fn replicator() -> (tempfile::TempDir, FileReplicator) {
        let dir = tempfile::tempdir().unwrap();
        let replicator = FileReplicator::new(dir.path().join("bundles"));
        (dir, replicator)
    }

    #[test]
    fn package_stages_bundle_file() {
        let (_dir, replicator) = replicator();
        let bundle = replicator
            .package("driver", "replicant.1", &Paraboloid::default())
            .unwrap();

        assert!(bundle.path.exists());
        assert!(bundle.id.starts_with("driver-replicant.1-"));
        assert_eq!(bundle.id.len(), "driver-replicant.1-".len() + 12);
        assert_eq!(bundle.requirements.capabilities, vec![KIND.to_string()]);
        let bytes = std::fs::read(&bundle.path).unwrap();
        assert_eq!(sha256_hex(&bytes), bundle.sha256);
    }

    #[test]
    fn transfer_delivers_payload_to_server() {
        let (_dir, replicator) = replicator();
        let bundle = replicator
            .package("driver", "replicant.1", &Paraboloid::with_limit(2.0))
            .unwrap();

        let alloc = LocalAllocator::new(1, vec![KIND.to_string()], Arc::new(Paraboloid::load));
        let (mut server, _) = alloc.allocate(&bundle.requirements).unwrap();
        replicator.transfer(&bundle, server.as_mut()).unwrap();
        assert!(server.has_bundle(&bundle.id));
        assert!(server.load_model(&bundle.id).is_ok());
        alloc.release(server);
    }

    #[test]
    fn transfer_detects_corrupt_bundle() {
        let (_dir, replicator) = replicator();
        let bundle = replicator
            .package("driver", "replicant.1", &Paraboloid::default())
            .unwrap();
        std::fs::write(&bundle.path, b"tampered").unwrap();

        let alloc = LocalAllocator::new(1, vec![KIND.to_string()], Arc::new(Paraboloid::load));
        let (mut server, _) = alloc.allocate(&bundle.requirements).unwrap();
        let err = replicator.transfer(&bundle, server.as_mut()).unwrap_err();
        assert!(matches!(err, ReplicationError::Corrupt { .. }));
        assert!(!server.has_bundle(&bundle.id));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, replicator) = replicator();
        let bundle = replicator
            .package("driver", "replicant.1", &Paraboloid::default())
            .unwrap();
        replicator.remove(&bundle).unwrap();
        assert!(!bundle.path.exists());
        replicator.remove(&bundle).unwrap();
    }

    #[test]
    fn transfer_of_removed_bundle_fails() {
        let (_dir, replicator) = replicator();
        let bundle = replicator
            .package("driver", "replicant.1", &Paraboloid::default())
            .unwrap();
        replicator.remove(&bundle).unwrap();

        let alloc = LocalAllocator::new(1, vec![KIND.to_string()], Arc::new(Paraboloid::load));
        let (mut server, _) = alloc.allocate(&bundle.requirements).unwrap();
        assert!(matches!(
            replicator.transfer(&bundle, server.as_mut()),
            Err(ReplicationError::Io { .. })
        ));
    }
}
