use crate::error::LoadError;
use crate::image::{ImageMetadata, IMAGE_EXTENSION};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locates dependency images on disk relative to a unit's resolution root.
///
/// The root is either a directory holding `<name>.wasm` files, or a single
/// image file whose siblings are searched the same way.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    root: PathBuf,
}

impl DependencyResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the image providing library `name`, if one exists
    pub fn resolve_dependency_path(&self, name: &str) -> Option<PathBuf> {
        let directory = if self.root.is_file() {
            if self.root.file_stem().and_then(|stem| stem.to_str()) == Some(name) {
                return Some(self.root.clone());
            }
            self.root.parent()?
        } else {
            self.root.as_path()
        };

        let candidate = directory.join(format!("{}.{}", name, IMAGE_EXTENSION));
        candidate.is_file().then_some(candidate)
    }

    /// Read and decode the image for `name`. `Ok(None)` when nothing matches.
    pub(crate) fn load(&self, name: &str) -> Result<Option<(Vec<u8>, ImageMetadata)>, LoadError> {
        let Some(path) = self.resolve_dependency_path(name) else {
            return Ok(None);
        };
        debug!("Resolving dependency {} from {:?}", name, path);

        let bytes = std::fs::read(&path)?;
        let metadata = ImageMetadata::decode(&bytes)?;
        if metadata.name != name {
            return Err(LoadError::InvalidImage(format!(
                "{:?} contains library `{}`, expected `{}`",
                path, metadata.name, name
            )));
        }
        Ok(Some((bytes, metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_from_directory() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Shapes.wasm"), b"").unwrap();

        let resolver = DependencyResolver::new(dir.path());
        assert_eq!(
            resolver.resolve_dependency_path("Shapes"),
            Some(dir.path().join("Shapes.wasm"))
        );
        assert_eq!(resolver.resolve_dependency_path("Missing"), None);
    }

    #[test]
    fn test_resolve_from_file_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("App.wasm");
        fs::write(&root, b"").unwrap();
        fs::write(dir.path().join("Shapes.wasm"), b"").unwrap();

        let resolver = DependencyResolver::new(&root);
        assert_eq!(resolver.resolve_dependency_path("App"), Some(root.clone()));
        assert_eq!(
            resolver.resolve_dependency_path("Shapes"),
            Some(dir.path().join("Shapes.wasm"))
        );
    }

    #[test]
    fn test_load_rejects_invalid_image() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Broken.wasm"), b"garbage").unwrap();

        let resolver = DependencyResolver::new(dir.path());
        assert!(matches!(
            resolver.load("Broken"),
            Err(LoadError::InvalidImage(_))
        ));
        assert!(resolver.load("Missing").unwrap().is_none());
    }
}
