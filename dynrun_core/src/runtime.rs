//! The base runtime library.
//!
//! `core` is referenced by every compilation and linked into every unit, so
//! scripts can always call `Math.Max(a, b)` and friends without naming a
//! reference path.

use crate::config::{LanguageVersion, OptimizationLevel, OutputKind};
use crate::error::LoadError;
use crate::frontend::{ReferenceBinary, ReferenceOrigin};
use crate::image::{
    append_custom_section, ClassInfo, ImageMetadata, MethodInfo, ParamInfo, TypeRef,
    FORMAT_VERSION, METADATA_SECTION,
};
use lazy_static::lazy_static;
use std::sync::Arc;

/// Library name of the base runtime
pub const CORE_LIBRARY: &str = "core";

const CORE_WAT: &str = r#"
(module
  (func (export "Math::Abs") (param $x i32) (result i32)
    (select
      (i32.sub (i32.const 0) (local.get $x))
      (local.get $x)
      (i32.lt_s (local.get $x) (i32.const 0))))
  (func (export "Math::Max") (param $a i32) (param $b i32) (result i32)
    (select (local.get $a) (local.get $b) (i32.gt_s (local.get $a) (local.get $b))))
  (func (export "Math::Min") (param $a i32) (param $b i32) (result i32)
    (select (local.get $a) (local.get $b) (i32.lt_s (local.get $a) (local.get $b))))
  (func (export "Math::Clamp") (param $v i32) (param $lo i32) (param $hi i32) (result i32)
    (select
      (local.get $lo)
      (select (local.get $hi) (local.get $v) (i32.gt_s (local.get $v) (local.get $hi)))
      (i32.lt_s (local.get $v) (local.get $lo))))
  (func (export "Math::Sign") (param $x i32) (result i32)
    (i32.sub
      (i32.gt_s (local.get $x) (i32.const 0))
      (i32.lt_s (local.get $x) (i32.const 0))))
)
"#;

lazy_static! {
    static ref CORE_IMAGE: Result<Arc<[u8]>, String> = assemble_core();
}

fn static_method(name: &str, params: &[&str]) -> MethodInfo {
    MethodInfo {
        name: name.to_string(),
        is_static: true,
        is_public: true,
        params: params
            .iter()
            .map(|p| ParamInfo {
                name: p.to_string(),
                ty: TypeRef::Int,
            })
            .collect(),
        returns: TypeRef::Int,
    }
}

/// Metadata of the base runtime library
pub fn core_metadata() -> ImageMetadata {
    ImageMetadata {
        name: CORE_LIBRARY.to_string(),
        format_version: FORMAT_VERSION,
        language_version: LanguageVersion::LATEST,
        output_kind: OutputKind::DynamicLibrary,
        optimization_level: OptimizationLevel::Release,
        entry_point: None,
        classes: vec![ClassInfo {
            name: "Math".to_string(),
            is_public: true,
            size: 0,
            fields: Vec::new(),
            methods: vec![
                static_method("Abs", &["x"]),
                static_method("Max", &["a", "b"]),
                static_method("Min", &["a", "b"]),
                static_method("Clamp", &["v", "lo", "hi"]),
                static_method("Sign", &["x"]),
            ],
        }],
        dependencies: Vec::new(),
    }
}

fn assemble_core() -> Result<Arc<[u8]>, String> {
    let mut bytes = wat::parse_str(CORE_WAT).map_err(|e| e.to_string())?;
    let metadata = core_metadata().encode().map_err(|e| e.to_string())?;
    append_custom_section(&mut bytes, METADATA_SECTION, &metadata);
    Ok(bytes.into())
}

/// The assembled base runtime image
pub(crate) fn core_image() -> Result<Arc<[u8]>, LoadError> {
    CORE_IMAGE.clone().map_err(LoadError::InvalidImage)
}

/// Compile-time reference to the base runtime library
pub fn core_reference() -> ReferenceBinary {
    ReferenceBinary {
        name: CORE_LIBRARY.to_string(),
        origin: ReferenceOrigin::BaseRuntime,
        metadata: core_metadata(),
    }
}
