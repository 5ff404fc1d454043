use super::DependencyResolver;
use crate::artifact::LoadedArtifact;
use crate::config::UnitLimits;
use crate::error::LoadError;
use crate::host::HostContext;
use crate::image::{BinaryImage, ImageMetadata};
use crate::runtime::{core_image, core_metadata, CORE_LIBRARY};
use crate::tracker::ObservationHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;
use wasmtime::{Engine, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    UnloadRequested,
    /// Every strong reference is gone
    Unloaded,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::UnloadRequested,
            _ => Self::Unloaded,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::UnloadRequested => 1,
            Self::Unloaded => 2,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::UnloadRequested => write!(f, "unload requested"),
            Self::Unloaded => write!(f, "unloaded"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitOptions {
    pub name: String,
    pub resolution_root: Option<PathBuf>,
    pub limits: UnitLimits,
}

impl UnitOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_resolution_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resolution_root = Some(root.into());
        self
    }

    pub fn with_limits(mut self, limits: UnitLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Per-store state
pub(crate) struct UnitData {
    limits: StoreLimits,
}

/// Everything guarded by the unit lock
pub(crate) struct UnitRuntime {
    pub store: Store<UnitData>,
    linker: Linker<UnitData>,
    /// Library names instantiated in this unit
    linked: HashSet<String>,
}

/// An image waiting to be instantiated as a dependency
struct PendingModule {
    name: String,
    bytes: Arc<[u8]>,
}

pub(crate) struct UnitInner {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub collectible: bool,
    resolution_root: Option<PathBuf>,
    state: AtomicU8,
    engine: Engine,
    /// Fallback for dependencies; `None` for the host default context itself
    host: Option<Arc<HostContext>>,
    pub runtime: Mutex<UnitRuntime>,
}

impl UnitInner {
    fn new(
        engine: &Engine,
        name: String,
        resolution_root: Option<PathBuf>,
        limits: &UnitLimits,
        collectible: bool,
        host: Option<Arc<HostContext>>,
    ) -> Self {
        let data = UnitData {
            limits: StoreLimitsBuilder::new()
                .memory_size(limits.memory_limit)
                .build(),
        };
        let mut store = Store::new(engine, data);
        store.limiter(|data| &mut data.limits);

        Self {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            collectible,
            resolution_root,
            state: AtomicU8::new(UnitState::Active.as_u8()),
            engine: engine.clone(),
            host,
            runtime: Mutex::new(UnitRuntime {
                store,
                linker: Linker::new(engine),
                linked: HashSet::new(),
            }),
        }
    }

    fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Find the image for a library this unit has not linked yet
    fn locate(&self, name: &str) -> Result<Option<(Arc<[u8]>, ImageMetadata)>, LoadError> {
        if name == CORE_LIBRARY {
            return Ok(Some((core_image()?, core_metadata())));
        }
        if let Some(root) = &self.resolution_root {
            if let Some((bytes, metadata)) = DependencyResolver::new(root).load(name)? {
                return Ok(Some((bytes.into(), metadata)));
            }
        }
        if let Some(host) = &self.host {
            if let Some(image) = host.find_image(name) {
                debug!("Resolving dependency {} from the host context", name);
                return Ok(Some((image.bytes, image.metadata)));
            }
        }
        Ok(None)
    }

    /// Work out every dependency that must be instantiated before `metadata`,
    /// in instantiation order, without touching the store.
    fn plan(
        &self,
        runtime: &UnitRuntime,
        metadata: &ImageMetadata,
        chain: &mut Vec<String>,
        planned: &mut Vec<PendingModule>,
    ) -> Result<(), LoadError> {
        for dependency in &metadata.dependencies {
            if runtime.linked.contains(dependency)
                || planned.iter().any(|pending| &pending.name == dependency)
            {
                continue;
            }
            if chain.contains(dependency) {
                chain.push(dependency.clone());
                return Err(LoadError::CyclicDependency(chain.join(" -> ")));
            }

            let (bytes, dependency_metadata) =
                self.locate(dependency)?
                    .ok_or_else(|| LoadError::UnresolvedDependency {
                        artifact: metadata.name.clone(),
                        dependency: dependency.clone(),
                    })?;

            chain.push(dependency.clone());
            self.plan(runtime, &dependency_metadata, chain, planned)?;
            chain.pop();
            planned.push(PendingModule {
                name: dependency.clone(),
                bytes,
            });
        }
        Ok(())
    }

    fn compile(&self, name: &str, bytes: &[u8]) -> Result<Module, LoadError> {
        Module::new(&self.engine, bytes).map_err(|e| LoadError::link(name, e))
    }

    /// Instantiate `module` and register its exports under `name` in `linker`
    fn link(
        &self,
        linker: &mut Linker<UnitData>,
        store: &mut Store<UnitData>,
        name: &str,
        module: &Module,
    ) -> Result<Instance, LoadError> {
        let instance = linker
            .instantiate(&mut *store, module)
            .map_err(|e| LoadError::link(name, e))?;
        linker
            .instance(&mut *store, name, instance)
            .map_err(|e| LoadError::link(name, e))?;
        debug!("Linked {} into unit {}", name, self.id);
        Ok(instance)
    }
}

impl fmt::Debug for UnitInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitInner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("collectible", &self.collectible)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for UnitInner {
    fn drop(&mut self) {
        self.state
            .store(UnitState::Unloaded.as_u8(), Ordering::SeqCst);
        debug!("Reclaimed isolation unit {} ({})", self.name, self.id);
    }
}

/// A private execution context for loaded artifacts.
///
/// Each unit owns its own store and linker, so instances in one unit can
/// never see those of another. A collectible unit is reclaimed once the last
/// handle to it, including every artifact loaded into it, is dropped.
#[derive(Debug, Clone)]
pub struct IsolationUnit {
    pub(crate) inner: Arc<UnitInner>,
}

impl IsolationUnit {
    /// Create a collectible unit
    pub fn create(host: Arc<HostContext>, options: UnitOptions) -> Self {
        let inner = UnitInner::new(
            host.engine(),
            options.name,
            options.resolution_root,
            &options.limits,
            true,
            Some(host.clone()),
        );
        info!("Created isolation unit {} ({})", inner.name, inner.id);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The non-collectible default context of a host
    pub(crate) fn host_default(engine: &Engine, limits: &UnitLimits) -> Self {
        let inner = UnitInner::new(engine, "host".to_string(), None, limits, false, None);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<UnitInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn resolution_root(&self) -> Option<&Path> {
        self.inner.resolution_root.as_deref()
    }

    pub fn is_collectible(&self) -> bool {
        self.inner.collectible
    }

    pub fn state(&self) -> UnitState {
        self.inner.state()
    }

    /// Names of the libraries instantiated in this unit
    pub fn linked_libraries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.runtime.lock().linked.iter().cloned().collect();
        names.sort();
        names
    }

    /// Load an image and every library it imports into this unit.
    ///
    /// Dependencies are searched in this unit, then the `core` runtime, then
    /// the resolution root, then the host's loaded images. An unresolved or
    /// cyclic dependency fails the load before anything is instantiated, and
    /// a module that fails to compile or link leaves the unit unchanged.
    pub fn load_image(&self, image: &mut BinaryImage) -> Result<LoadedArtifact, LoadError> {
        if self.state() != UnitState::Active {
            return Err(LoadError::UnitUnloading(self.inner.id));
        }

        let bytes = image.read_fully()?;
        let metadata = ImageMetadata::decode(&bytes)?;
        debug!("Loading {} into unit {}", metadata.name, self.inner.id);

        let mut guard = self.inner.runtime.lock();
        let runtime = &mut *guard;
        if runtime.linked.contains(&metadata.name) {
            return Err(LoadError::DuplicateArtifact(
                metadata.name.clone(),
                self.inner.id,
            ));
        }

        let mut planned = Vec::new();
        let mut chain = vec![metadata.name.clone()];
        self.inner
            .plan(runtime, &metadata, &mut chain, &mut planned)?;

        let mut modules = Vec::with_capacity(planned.len());
        for pending in &planned {
            modules.push(self.inner.compile(&pending.name, &pending.bytes)?);
        }
        let main = self.inner.compile(&metadata.name, &bytes)?;

        // Linking goes through a copy that only replaces the unit's linker
        // once every module is instantiated.
        let mut linker = runtime.linker.clone();
        for (pending, module) in planned.iter().zip(&modules) {
            self.inner
                .link(&mut linker, &mut runtime.store, &pending.name, module)?;
        }
        let instance = self
            .inner
            .link(&mut linker, &mut runtime.store, &metadata.name, &main)?;
        runtime.linker = linker;
        runtime
            .linked
            .extend(planned.iter().map(|pending| pending.name.clone()));
        runtime.linked.insert(metadata.name.clone());
        drop(guard);

        info!(
            "Loaded {} into unit {} ({} dependencies linked)",
            metadata.name,
            self.inner.id,
            planned.len()
        );
        Ok(LoadedArtifact::new(self.inner.clone(), instance, metadata))
    }

    /// Flag the unit for unloading. Returns whether this call made the
    /// transition; the host default context never transitions.
    pub fn request_unload(&self) -> bool {
        if !self.inner.collectible {
            debug!("Ignoring unload request for the host default context");
            return false;
        }
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                UnitState::Active.as_u8(),
                UnitState::UnloadRequested.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if transitioned {
            info!("Unload requested for unit {} ({})", self.inner.name, self.inner.id);
        }
        transitioned
    }

    /// A handle that watches this unit without keeping it alive
    pub fn observe(&self) -> ObservationHandle {
        ObservationHandle::new(self)
    }

    pub(crate) fn downgrade(&self) -> Weak<UnitInner> {
        Arc::downgrade(&self.inner)
    }
}
