use crate::artifact::LoadedArtifact;
use crate::builder::ArtifactBuilder;
use crate::config::{CompilationOptions, RuntimeConfig, UnitLimits, UnloadPolicy};
use crate::error::{CompileError, Error, LoadError};
use crate::frontend::{ClassFrontend, Frontend};
use crate::host::HostContext;
use crate::image::BinaryImage;
use crate::isolation::{IsolationUnit, UnitOptions};
use crate::source::SourceInput;
use crate::tracker::{LifecycleTracker, UnloadReport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Facade that compiles sources, loads them into the host or into isolated
/// units, and later unloads every isolated unit it created.
///
/// Dropping the orchestrator unloads as well, unless [`release`](Self::release)
/// already did.
#[derive(Debug)]
pub struct Orchestrator<F: Frontend = ClassFrontend> {
    builder: ArtifactBuilder<F>,
    host: Arc<HostContext>,
    tracker: Arc<LifecycleTracker>,
    policy: UnloadPolicy,
    limits: UnitLimits,
    released: bool,
}

impl Orchestrator<ClassFrontend> {
    /// Create an orchestrator on the global host with a fresh tracker
    pub fn new() -> Self {
        Self::with_frontend(ClassFrontend::new())
    }

    /// Create an orchestrator using the unload policy and unit limits of a
    /// configuration
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new()
            .with_unload_policy(config.unload)
            .with_unit_limits(config.unit)
    }
}

impl Default for Orchestrator<ClassFrontend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Frontend> Orchestrator<F> {
    pub fn with_frontend(frontend: F) -> Self {
        let host = HostContext::global();
        Self {
            builder: ArtifactBuilder::with_frontend(frontend, host.clone()),
            host,
            tracker: Arc::new(LifecycleTracker::new()),
            policy: UnloadPolicy::default(),
            limits: UnitLimits::default(),
            released: false,
        }
    }

    /// Use a different host context for compilation and loading
    pub fn with_host(mut self, host: Arc<HostContext>) -> Self {
        self.builder = self.builder.rehost(host.clone());
        self.host = host;
        self
    }

    /// Share a tracker with other orchestrators
    pub fn with_tracker(mut self, tracker: Arc<LifecycleTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_unload_policy(mut self, policy: UnloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_unit_limits(mut self, limits: UnitLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn builder(&self) -> &ArtifactBuilder<F> {
        &self.builder
    }

    /// Compile without loading
    pub fn compile(
        &self,
        source: impl Into<SourceInput>,
        options: &CompilationOptions,
    ) -> Result<BinaryImage, CompileError> {
        self.builder.build(source.into(), options)
    }

    /// Compile on tokio's blocking pool
    pub async fn compile_async(
        &self,
        source: impl Into<SourceInput>,
        options: CompilationOptions,
    ) -> Result<BinaryImage, CompileError> {
        self.builder.build_async(source.into(), options).await
    }

    /// Compile a source and load the result.
    ///
    /// With `isolate` the artifact gets a fresh collectible unit whose
    /// resolution root is the options' dependency root, or else their first
    /// reference path. Otherwise it is loaded into the host default context.
    pub fn compile_and_load(
        &self,
        source: impl Into<SourceInput>,
        options: &CompilationOptions,
        isolate: bool,
    ) -> Result<LoadedArtifact, Error> {
        let mut image = self.compile(source, options)?;
        let root = options.resolution_root().map(|path| path.to_path_buf());
        Ok(self.load(&mut image, isolate, root)?)
    }

    /// Load an image compiled earlier
    pub fn load(
        &self,
        image: &mut BinaryImage,
        isolate: bool,
        resolution_root: Option<PathBuf>,
    ) -> Result<LoadedArtifact, LoadError> {
        if !isolate {
            return self.host.load(image);
        }

        let mut options = UnitOptions::new(image.name()).with_limits(self.limits);
        options.resolution_root = resolution_root;
        let unit = IsolationUnit::create(self.host.clone(), options);
        let handle = self.tracker.track(&unit);
        let artifact = unit.load_image(image)?;
        self.tracker.record_artifact(&handle, &artifact);
        info!(
            artifact = %artifact.name(),
            unit_id = %artifact.unit_id(),
            "Loaded artifact in isolation"
        );
        Ok(artifact)
    }

    /// Unload every isolated unit this orchestrator's tracker knows about.
    /// Safe to call any number of times.
    pub fn unload(&self) -> UnloadReport {
        let report = self.tracker.unload_all(&self.policy);
        debug!(
            unloaded = report.units_unloaded,
            still_alive = report.units_still_alive,
            "Unload pass finished"
        );
        report
    }

    /// Dispose of the orchestrator, unloading exactly once
    pub fn release(mut self) -> UnloadReport {
        self.released = true;
        self.unload()
    }
}

impl<F: Frontend> Drop for Orchestrator<F> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.unload();
        }
    }
}
