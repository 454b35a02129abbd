//! Program catalog lookup: resolving node programs to names and
//! executable specs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tessera_sandbox::ExecutableSpec;

use crate::error::{EngineError, EngineResult};
use crate::graph::{ProgramId, VersionId};

/// Catalog collaborator resolving program references on workflow nodes.
#[async_trait]
pub trait ProgramLookup: Send + Sync {
    /// Returns the display name of a program, when it exists.
    async fn program_name(&self, id: ProgramId) -> EngineResult<Option<String>>;

    /// Returns the executable spec for a program version; the latest
    /// version when `version` is `None`.
    async fn executable_spec(
        &self,
        id: ProgramId,
        version: Option<VersionId>,
    ) -> EngineResult<ExecutableSpec>;
}

struct CatalogEntry {
    name: String,
    latest: ExecutableSpec,
    versions: HashMap<VersionId, ExecutableSpec>,
}

/// In-memory [`ProgramLookup`] for tests and embedded use.
#[derive(Default)]
pub struct MemoryProgramCatalog {
    programs: Mutex<HashMap<ProgramId, CatalogEntry>>,
}

impl MemoryProgramCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a program, returning its id.
    pub fn register(&self, name: impl Into<String>, spec: ExecutableSpec) -> ProgramId {
        let id = ProgramId::new();
        self.lock().insert(
            id,
            CatalogEntry {
                name: name.into(),
                latest: spec,
                versions: HashMap::new(),
            },
        );
        id
    }

    /// Registers a pinned version of an existing program.
    pub fn register_version(
        &self,
        program: ProgramId,
        spec: ExecutableSpec,
    ) -> EngineResult<VersionId> {
        let mut programs = self.lock();
        let entry = programs
            .get_mut(&program)
            .ok_or(EngineError::ProgramNotFound(program))?;
        let version = VersionId::new();
        entry.versions.insert(version, spec);
        Ok(version)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProgramId, CatalogEntry>> {
        match self.programs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for MemoryProgramCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProgramCatalog")
            .field("programs", &self.lock().len())
            .finish()
    }
}

#[async_trait]
impl ProgramLookup for MemoryProgramCatalog {
    async fn program_name(&self, id: ProgramId) -> EngineResult<Option<String>> {
        Ok(self.lock().get(&id).map(|entry| entry.name.clone()))
    }

    async fn executable_spec(
        &self,
        id: ProgramId,
        version: Option<VersionId>,
    ) -> EngineResult<ExecutableSpec> {
        let programs = self.lock();
        let entry = programs.get(&id).ok_or(EngineError::ProgramNotFound(id))?;
        match version {
            None => Ok(entry.latest.clone()),
            Some(version) => entry
                .versions
                .get(&version)
                .cloned()
                .ok_or(EngineError::ProgramNotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let catalog = MemoryProgramCatalog::new();
        let id = catalog.register("extract", ExecutableSpec::shell("echo latest"));
        let pinned = catalog
            .register_version(id, ExecutableSpec::shell("echo pinned"))
            .unwrap();

        assert_eq!(
            catalog.program_name(id).await.unwrap().as_deref(),
            Some("extract")
        );
        let latest = catalog.executable_spec(id, None).await.unwrap();
        assert_eq!(latest.entrypoint, "echo latest");
        let spec = catalog.executable_spec(id, Some(pinned)).await.unwrap();
        assert_eq!(spec.entrypoint, "echo pinned");
    }

    #[tokio::test]
    async fn test_unknown_program() {
        let catalog = MemoryProgramCatalog::new();
        assert_eq!(catalog.program_name(ProgramId::new()).await.unwrap(), None);
        assert!(
            catalog
                .executable_spec(ProgramId::new(), None)
                .await
                .is_err()
        );
    }
}
