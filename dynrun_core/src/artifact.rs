//! Handles to loaded artifacts, their types and objects.
//!
//! Every handle here keeps its artifact, and through it the owning unit,
//! alive. A unit can only be reclaimed once all of them are dropped.

use crate::error::InvokeError;
use crate::image::{ClassInfo, FieldInfo, ImageMetadata, MethodInfo, TypeRef};
use crate::isolation::UnitInner;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;
use wasmtime::{Instance, Val};

/// A value passed to or returned from artifact code
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Void,
    Object(ObjectHandle),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Bool(value) => write!(f, "{}", value),
            Self::Void => write!(f, "void"),
            Self::Object(object) => write!(f, "<{} @{}>", object.class_name(), object.ptr),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub(crate) struct ArtifactInner {
    unit: Arc<UnitInner>,
    instance: Instance,
    metadata: ImageMetadata,
}

impl Drop for ArtifactInner {
    fn drop(&mut self) {
        debug!("Released artifact {} of unit {}", self.metadata.name, self.unit.id);
    }
}

/// An image instantiated inside a unit
#[derive(Clone)]
pub struct LoadedArtifact {
    inner: Arc<ArtifactInner>,
}

impl LoadedArtifact {
    pub(crate) fn new(unit: Arc<UnitInner>, instance: Instance, metadata: ImageMetadata) -> Self {
        Self {
            inner: Arc::new(ArtifactInner {
                unit,
                instance,
                metadata,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.metadata.name
    }

    pub fn unit_id(&self) -> Uuid {
        self.inner.unit.id
    }

    /// Whether this artifact lives in a collectible unit rather than the host
    pub fn is_isolated(&self) -> bool {
        self.inner.unit.collectible
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.inner.metadata
    }

    pub fn types(&self) -> Vec<ArtifactType> {
        (0..self.inner.metadata.classes.len())
            .map(|index| ArtifactType {
                artifact: self.clone(),
                index,
            })
            .collect()
    }

    pub fn get_type(&self, name: &str) -> Option<ArtifactType> {
        let index = self
            .inner
            .metadata
            .classes
            .iter()
            .position(|class| class.name == name)?;
        Some(ArtifactType {
            artifact: self.clone(),
            index,
        })
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.inner.metadata.entry_point.as_deref()
    }

    /// Run the entry point of an executable
    pub fn run(&self) -> Result<Value, InvokeError> {
        let export = self
            .entry_point()
            .ok_or_else(|| InvokeError::NoEntryPoint(self.name().to_string()))?;
        debug!("Running {} through {}", self.name(), export);
        match self.call(export, &[])? {
            Some(value) => Ok(Value::Int(value)),
            None => Ok(Value::Void),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ArtifactInner> {
        Arc::downgrade(&self.inner)
    }

    fn same_artifact(&self, other: &LoadedArtifact) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn call(&self, export: &str, args: &[i32]) -> Result<Option<i32>, InvokeError> {
        let mut guard = self.inner.unit.runtime.lock();
        let store = &mut guard.store;
        let func = self
            .inner
            .instance
            .get_func(&mut *store, export)
            .ok_or_else(|| InvokeError::MissingExport(export.to_string()))?;

        let params: Vec<Val> = args.iter().map(|arg| Val::I32(*arg)).collect();
        let mut results = vec![Val::I32(0); func.ty(&*store).results().len()];
        func.call(&mut *store, &params, &mut results)?;
        Ok(results.first().and_then(Val::i32))
    }

    fn read_i32(&self, address: u32) -> Result<i32, InvokeError> {
        let mut guard = self.inner.unit.runtime.lock();
        let store = &mut guard.store;
        let memory = self
            .inner
            .instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| InvokeError::MissingExport("memory".to_string()))?;
        let mut buffer = [0u8; 4];
        memory
            .read(&*store, address as usize, &mut buffer)
            .map_err(|err| InvokeError::Trap(err.to_string()))?;
        Ok(i32::from_le_bytes(buffer))
    }

    fn to_raw(&self, method: &str, params: &[TypeRef], args: &[Value]) -> Result<Vec<i32>, InvokeError> {
        if params.len() != args.len() {
            return Err(InvokeError::Arity {
                method: method.to_string(),
                expected: params.len(),
                found: args.len(),
            });
        }

        params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(index, (ty, arg))| match (ty, arg) {
                (TypeRef::Int, Value::Int(value)) => Ok(*value),
                (TypeRef::Bool, Value::Bool(value)) => Ok(i32::from(*value)),
                (TypeRef::Class { library, name }, Value::Object(object))
                    if object.artifact().name() == library
                        && object.class_name() == name
                        && Arc::ptr_eq(&object.artifact().inner.unit, &self.inner.unit) =>
                {
                    Ok(object.ptr)
                }
                _ => Err(InvokeError::ArgumentType {
                    method: method.to_string(),
                    index,
                    expected: ty.to_string(),
                }),
            })
            .collect()
    }

    fn from_raw(&self, ty: &TypeRef, raw: Option<i32>) -> Result<Value, InvokeError> {
        let raw = raw.unwrap_or_default();
        match ty {
            TypeRef::Int => Ok(Value::Int(raw)),
            TypeRef::Bool => Ok(Value::Bool(raw != 0)),
            TypeRef::Void => Ok(Value::Void),
            TypeRef::Class { library, name } => {
                if library != self.name() {
                    return Err(InvokeError::ForeignObject(format!("{}.{}", library, name)));
                }
                let ty = self
                    .get_type(name)
                    .ok_or_else(|| InvokeError::UnknownType(name.clone()))?;
                Ok(Value::Object(ObjectHandle { ty, ptr: raw }))
            }
        }
    }
}

impl fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("name", &self.name())
            .field("unit", &self.unit_id())
            .field("isolated", &self.is_isolated())
            .finish()
    }
}

/// A class of a loaded artifact
#[derive(Clone)]
pub struct ArtifactType {
    artifact: LoadedArtifact,
    index: usize,
}

impl ArtifactType {
    fn info(&self) -> &ClassInfo {
        &self.artifact.inner.metadata.classes[self.index]
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn artifact(&self) -> &LoadedArtifact {
        &self.artifact
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.info().fields
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.info().methods
    }

    fn method(&self, name: &str) -> Result<&MethodInfo, InvokeError> {
        self.info()
            .method(name)
            .ok_or_else(|| InvokeError::UnknownMethod {
                class: self.name().to_string(),
                method: name.to_string(),
            })
    }

    fn export(&self, member: &str) -> String {
        format!("{}::{}", self.name(), member)
    }

    /// Construct a new object, running its field initializers
    pub fn create_instance(&self) -> Result<ObjectHandle, InvokeError> {
        let ptr = self
            .artifact
            .call(&self.export("new"), &[])?
            .ok_or_else(|| InvokeError::MissingExport(self.export("new")))?;
        Ok(ObjectHandle {
            ty: self.clone(),
            ptr,
        })
    }

    pub fn invoke_static(&self, method: &str, args: &[Value]) -> Result<Value, InvokeError> {
        let info = self.method(method)?;
        if !info.is_static {
            return Err(InvokeError::StaticMismatch(format!(
                "{}.{} is an instance method",
                self.name(),
                method
            )));
        }

        let export = self.export(method);
        let params: Vec<TypeRef> = info.params.iter().map(|p| p.ty.clone()).collect();
        let raw = self.artifact.to_raw(&export, &params, args)?;
        let result = self.artifact.call(&export, &raw)?;
        self.artifact.from_raw(&info.returns, result)
    }
}

impl fmt::Debug for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactType")
            .field("artifact", &self.artifact.name())
            .field("name", &self.name())
            .finish()
    }
}

/// An object living in an artifact's linear memory
#[derive(Clone)]
pub struct ObjectHandle {
    ty: ArtifactType,
    ptr: i32,
}

impl ObjectHandle {
    pub fn class_name(&self) -> &str {
        self.ty.name()
    }

    pub fn artifact(&self) -> &LoadedArtifact {
        &self.ty.artifact
    }

    pub fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, InvokeError> {
        let info = self.ty.method(method)?;
        if info.is_static {
            return Err(InvokeError::StaticMismatch(format!(
                "{}.{} is a static method",
                self.class_name(),
                method
            )));
        }

        let export = self.ty.export(method);
        let params: Vec<TypeRef> = info.params.iter().map(|p| p.ty.clone()).collect();
        let mut raw = Vec::with_capacity(args.len() + 1);
        raw.push(self.ptr);
        raw.extend(self.ty.artifact.to_raw(&export, &params, args)?);
        let result = self.ty.artifact.call(&export, &raw)?;
        self.ty.artifact.from_raw(&info.returns, result)
    }

    pub fn get_field(&self, name: &str) -> Result<Value, InvokeError> {
        let field = self
            .ty
            .info()
            .field(name)
            .ok_or_else(|| InvokeError::UnknownField {
                class: self.class_name().to_string(),
                field: name.to_string(),
            })?;
        let raw = self.ty.artifact.read_i32(self.ptr as u32 + field.offset)?;
        self.ty.artifact.from_raw(&field.ty, Some(raw))
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.ty.artifact.same_artifact(&other.ty.artifact)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("class", &self.class_name())
            .field("ptr", &self.ptr)
            .finish()
    }
}
