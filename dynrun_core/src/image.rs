//! In-memory binary images.
//!
//! An image is a WebAssembly module with one extra custom section,
//! `dynrun.metadata`, holding the JSON-encoded [`ImageMetadata`] that
//! describes the classes the module implements. The wasm layout itself stays
//! standard, so any wasm tool can inspect an image.

use crate::config::{LanguageVersion, OptimizationLevel, OutputKind};
use crate::diagnostics::Diagnostic;
use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use wasm_encoder::{CustomSection, Section};
use wasmparser::{Parser, Payload};

/// Custom section carrying the image metadata
pub const METADATA_SECTION: &str = "dynrun.metadata";

/// File extension of images resolved from disk
pub const IMAGE_EXTENSION: &str = "wasm";

pub const FORMAT_VERSION: u32 = 1;

/// A type as seen across the image boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypeRef {
    Int,
    Bool,
    Void,
    Class { library: String, name: String },
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Void => write!(f, "void"),
            Self::Class { library, name } => write!(f, "{}.{}", library, name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub ty: TypeRef,
    /// Byte offset inside the object
    pub offset: u32,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub is_static: bool,
    pub is_public: bool,
    pub params: Vec<ParamInfo>,
    pub returns: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    pub is_public: bool,
    /// Object size in bytes
    pub size: u32,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

impl ClassInfo {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Type metadata stored alongside the code of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub name: String,
    pub format_version: u32,
    pub language_version: LanguageVersion,
    pub output_kind: OutputKind,
    pub optimization_level: OptimizationLevel,
    /// Export name of the entry point, for executables
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub classes: Vec<ClassInfo>,
    /// Libraries this image imports from
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ImageMetadata {
    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode the metadata section of a wasm binary
    pub fn decode(bytes: &[u8]) -> Result<Self, LoadError> {
        let section = read_custom_section(bytes, METADATA_SECTION)
            .map_err(LoadError::InvalidImage)?
            .ok_or_else(|| {
                LoadError::InvalidImage(format!("missing `{}` section", METADATA_SECTION))
            })?;

        let metadata: Self = serde_json::from_slice(section)
            .map_err(|e| LoadError::InvalidImage(format!("malformed metadata: {}", e)))?;

        if metadata.format_version != FORMAT_VERSION {
            return Err(LoadError::InvalidImage(format!(
                "unsupported format version {}",
                metadata.format_version
            )));
        }
        Ok(metadata)
    }
}

/// Compiled output of one build, positioned at offset 0 and ready to read.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    cursor: Cursor<Vec<u8>>,
    metadata: ImageMetadata,
    diagnostics: Vec<Diagnostic>,
}

impl BinaryImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LoadError> {
        let metadata = ImageMetadata::decode(&bytes)?;
        Ok(Self {
            cursor: Cursor::new(bytes),
            metadata,
            diagnostics: Vec::new(),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub(crate) fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Non-error diagnostics of the compile that produced this image
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    /// Read the whole image from the start, regardless of the current position
    pub(crate) fn read_fully(&mut self) -> std::io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.len());
        self.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for BinaryImage {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for BinaryImage {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

/// Append a custom section to the end of a wasm binary.
pub(crate) fn append_custom_section(bytes: &mut Vec<u8>, name: &str, payload: &[u8]) {
    CustomSection {
        name: name.into(),
        data: payload.into(),
    }
    .append_to(bytes);
}

/// Find a custom section by name
pub(crate) fn read_custom_section<'a>(
    bytes: &'a [u8],
    name: &str,
) -> Result<Option<&'a [u8]>, String> {
    for payload in Parser::new(0).parse_all(bytes) {
        match payload.map_err(|err| err.to_string())? {
            Payload::CustomSection(reader) if reader.name() == name => {
                return Ok(Some(reader.data()));
            }
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_module() -> Vec<u8> {
        wasm_encoder::Module::new().finish()
    }

    fn sample_metadata() -> ImageMetadata {
        ImageMetadata {
            name: "Sample".to_string(),
            format_version: FORMAT_VERSION,
            language_version: LanguageVersion::V2,
            output_kind: OutputKind::DynamicLibrary,
            optimization_level: OptimizationLevel::Release,
            entry_point: None,
            classes: vec![ClassInfo {
                name: "C".to_string(),
                is_public: true,
                size: 4,
                fields: Vec::new(),
                methods: vec![MethodInfo {
                    name: "F".to_string(),
                    is_static: false,
                    is_public: true,
                    params: Vec::new(),
                    returns: TypeRef::Int,
                }],
            }],
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_custom_section_lookup() {
        let mut bytes = empty_module();
        append_custom_section(&mut bytes, "other", b"ignored");
        append_custom_section(&mut bytes, "wanted", &[7u8; 300]);

        let section = read_custom_section(&bytes, "wanted").unwrap().unwrap();
        assert_eq!(section.len(), 300);
        assert!(read_custom_section(&bytes, "absent").unwrap().is_none());
    }

    #[test]
    fn test_metadata_section_survives_validation() {
        let mut bytes = wat::parse_str("(module (func (export \"f\") (result i32) i32.const 4))")
            .unwrap();
        append_custom_section(&mut bytes, METADATA_SECTION, &sample_metadata().encode().unwrap());

        wasmparser::Validator::new().validate_all(&bytes).unwrap();
        let image = BinaryImage::from_bytes(bytes).unwrap();
        assert_eq!(image.metadata(), &sample_metadata());
    }

    #[test]
    fn test_image_starts_at_offset_zero() {
        let mut bytes = empty_module();
        let metadata = sample_metadata();
        append_custom_section(&mut bytes, METADATA_SECTION, &metadata.encode().unwrap());

        let mut image = BinaryImage::from_bytes(bytes.clone()).unwrap();
        assert_eq!(image.position(), 0);
        assert_eq!(image.name(), "Sample");
        assert_eq!(image.metadata().class("C").unwrap().method("F").unwrap().returns, TypeRef::Int);

        let mut head = [0u8; 4];
        image.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"\0asm");
        assert_eq!(image.read_fully().unwrap(), bytes);
    }

    #[test]
    fn test_rejects_non_images() {
        assert!(matches!(
            BinaryImage::from_bytes(b"not wasm".to_vec()),
            Err(LoadError::InvalidImage(_))
        ));
        assert!(matches!(
            BinaryImage::from_bytes(empty_module()),
            Err(LoadError::InvalidImage(_))
        ));

        let mut truncated = empty_module();
        truncated.extend_from_slice(&[0, 0x7f]);
        assert!(read_custom_section(&truncated, METADATA_SECTION).is_err());
    }
}
