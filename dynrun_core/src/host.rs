use crate::artifact::LoadedArtifact;
use crate::config::UnitLimits;
use crate::error::LoadError;
use crate::frontend::{ReferenceBinary, ReferenceOrigin};
use crate::image::{BinaryImage, ImageMetadata};
use crate::isolation::IsolationUnit;
use crate::runtime::core_reference;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use wasmtime::Engine;

lazy_static! {
    static ref GLOBAL_HOST: Arc<HostContext> = Arc::new(HostContext::new());
}

/// An image loaded into the host default context
#[derive(Debug, Clone)]
pub struct HostImage {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub metadata: ImageMetadata,
}

/// The process-wide execution context.
///
/// Owns the shared engine and a non-collectible default unit. Images loaded
/// here stay for the life of the host, join the reference set of every later
/// compilation and serve as a fallback when isolated units resolve
/// dependencies.
pub struct HostContext {
    engine: Engine,
    default_unit: IsolationUnit,
    images: RwLock<Vec<HostImage>>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::with_limits(UnitLimits::default())
    }

    pub fn with_limits(limits: UnitLimits) -> Self {
        let engine = Engine::default();
        let default_unit = IsolationUnit::host_default(&engine, &limits);
        Self {
            engine,
            default_unit,
            images: RwLock::new(Vec::new()),
        }
    }

    /// The shared host of this process
    pub fn global() -> Arc<HostContext> {
        GLOBAL_HOST.clone()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn default_unit(&self) -> &IsolationUnit {
        &self.default_unit
    }

    /// Libraries every compilation may reference: `core` first, then the
    /// loaded images in load order
    pub fn reference_set(&self) -> Vec<ReferenceBinary> {
        let images = self.images.read();
        let mut references = Vec::with_capacity(images.len() + 1);
        references.push(core_reference());
        references.extend(images.iter().map(|image| ReferenceBinary {
            name: image.name.clone(),
            origin: ReferenceOrigin::Host,
            metadata: image.metadata.clone(),
        }));
        references
    }

    pub fn find_image(&self, name: &str) -> Option<HostImage> {
        self.images
            .read()
            .iter()
            .find(|image| image.name == name)
            .cloned()
    }

    pub fn image_names(&self) -> Vec<String> {
        self.images.read().iter().map(|i| i.name.clone()).collect()
    }

    /// Load an image into the default context for the life of the host
    pub fn load(&self, image: &mut BinaryImage) -> Result<LoadedArtifact, LoadError> {
        let artifact = self.default_unit.load_image(image)?;
        self.images.write().push(HostImage {
            name: artifact.name().to_string(),
            bytes: image.as_bytes().into(),
            metadata: artifact.metadata().clone(),
        });
        info!("Loaded {} into the host default context", artifact.name());
        Ok(artifact)
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("default_unit", &self.default_unit.id())
            .field("images", &self.image_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArtifactBuilder;
    use crate::config::CompilationOptions;
    use crate::source::SourceInput;

    #[test]
    fn test_loaded_images_join_reference_set() {
        let host = Arc::new(HostContext::new());
        assert_eq!(host.reference_set().len(), 1);

        let mut image = ArtifactBuilder::new(host.clone())
            .build(
                SourceInput::from_text("public class Greeter { public static int Code() => 7; }"),
                &CompilationOptions::new().with_target_name("Greeting"),
            )
            .unwrap();
        let artifact = host.load(&mut image).unwrap();
        assert!(!artifact.is_isolated());

        let names: Vec<String> = host.reference_set().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["core".to_string(), "Greeting".to_string()]);
        assert!(host.find_image("Greeting").is_some());
        assert!(host.find_image("Other").is_none());
    }

    #[test]
    fn test_global_host_is_shared() {
        assert!(Arc::ptr_eq(&HostContext::global(), &HostContext::global()));
        assert!(!HostContext::global().default_unit().is_collectible());
    }
}
