use super::ast::{ClassDecl, CompilationUnit, TypeName};
use super::ReferenceBinary;
use crate::diagnostics::{codes, Diagnostic, Location};
use crate::image::{ClassInfo, TypeRef};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Size of every field slot in an object
pub(crate) const FIELD_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ClassId {
    pub library: String,
    pub name: String,
}

/// Resolved type of an expression or declaration.
///
/// `Error` marks an expression whose type could not be determined; it is
/// compatible with everything so one mistake yields one diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ty {
    Int,
    Bool,
    Void,
    Class(ClassId),
    Error,
}

impl Ty {
    pub fn from_type_ref(ty: &TypeRef) -> Self {
        match ty {
            TypeRef::Int => Self::Int,
            TypeRef::Bool => Self::Bool,
            TypeRef::Void => Self::Void,
            TypeRef::Class { library, name } => Self::Class(ClassId {
                library: library.clone(),
                name: name.clone(),
            }),
        }
    }

    pub fn to_type_ref(&self) -> TypeRef {
        match self {
            Self::Int => TypeRef::Int,
            Self::Bool => TypeRef::Bool,
            Self::Void | Self::Error => TypeRef::Void,
            Self::Class(id) => TypeRef::Class {
                library: id.library.clone(),
                name: id.name.clone(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Void => write!(f, "void"),
            Self::Class(id) => write!(f, "{}", id.name),
            Self::Error => write!(f, "<error>"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FieldSymbol {
    pub name: String,
    pub ty: Ty,
    pub offset: u32,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MethodSymbol {
    pub name: String,
    pub is_static: bool,
    pub is_public: bool,
    pub params: Vec<(String, Ty)>,
    pub returns: Ty,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassSymbol {
    pub id: ClassId,
    pub is_public: bool,
    /// Defined by the unit being compiled
    pub own: bool,
    pub size: u32,
    pub fields: Vec<FieldSymbol>,
    pub methods: Vec<MethodSymbol>,
}

impl ClassSymbol {
    pub fn field(&self, name: &str) -> Option<&FieldSymbol> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodSymbol> {
        self.methods.iter().find(|m| m.name == name)
    }

    fn from_reference(library: &str, info: &ClassInfo) -> Self {
        Self {
            id: ClassId {
                library: library.to_string(),
                name: info.name.clone(),
            },
            is_public: info.is_public,
            own: false,
            size: info.size,
            fields: info
                .fields
                .iter()
                .map(|f| FieldSymbol {
                    name: f.name.clone(),
                    ty: Ty::from_type_ref(&f.ty),
                    offset: f.offset,
                    is_public: f.is_public,
                })
                .collect(),
            methods: info
                .methods
                .iter()
                .map(|m| MethodSymbol {
                    name: m.name.clone(),
                    is_static: m.is_static,
                    is_public: m.is_public,
                    params: m
                        .params
                        .iter()
                        .map(|p| (p.name.clone(), Ty::from_type_ref(&p.ty)))
                        .collect(),
                    returns: Ty::from_type_ref(&m.returns),
                })
                .collect(),
        }
    }
}

/// Every class visible to one compilation: its own and those of its references.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    classes: Vec<ClassSymbol>,
    by_name: BTreeMap<String, Vec<usize>>,
}

impl SymbolTable {
    pub fn build(
        unit: &CompilationUnit,
        target: &str,
        references: &[ReferenceBinary],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Self {
        let mut table = Self::default();

        for reference in references {
            for class in &reference.metadata.classes {
                table.insert(ClassSymbol::from_reference(&reference.name, class));
            }
        }

        // Declare own classes first so signatures can refer to any of them
        let mut declared = Vec::new();
        for class in &unit.classes {
            if table.own_index(&class.name).is_some() {
                diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_DEFINITION,
                        format!("class `{}` is defined more than once", class.name),
                    )
                    .at(class.location),
                );
                continue;
            }
            let index = table.insert(ClassSymbol {
                id: ClassId {
                    library: target.to_string(),
                    name: class.name.clone(),
                },
                is_public: class.is_public,
                own: true,
                size: 0,
                fields: Vec::new(),
                methods: Vec::new(),
            });
            declared.push((index, class));
        }

        for (index, class) in declared {
            let (fields, methods) = table.resolve_members(class, diagnostics);
            let symbol = &mut table.classes[index];
            symbol.size = (fields.len() as u32 * FIELD_SIZE).max(FIELD_SIZE);
            symbol.fields = fields;
            symbol.methods = methods;
        }

        table
    }

    fn insert(&mut self, class: ClassSymbol) -> usize {
        let index = self.classes.len();
        self.by_name
            .entry(class.id.name.clone())
            .or_default()
            .push(index);
        self.classes.push(class);
        index
    }

    fn own_index(&self, name: &str) -> Option<usize> {
        self.by_name
            .get(name)?
            .iter()
            .copied()
            .find(|&i| self.classes[i].own)
    }

    fn resolve_members(
        &self,
        class: &ClassDecl,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> (Vec<FieldSymbol>, Vec<MethodSymbol>) {
        let mut seen = BTreeSet::new();
        let mut duplicate = |name: &str, location: Location, diagnostics: &mut Vec<Diagnostic>| {
            if seen.insert(name.to_string()) {
                return false;
            }
            diagnostics.push(
                Diagnostic::error(
                    codes::DUPLICATE_DEFINITION,
                    format!("`{}` already defines a member named `{}`", class.name, name),
                )
                .at(location),
            );
            true
        };

        let mut fields = Vec::new();
        for field in &class.fields {
            if duplicate(&field.name, field.location, diagnostics) {
                continue;
            }
            let what = format!("field `{}`", field.name);
            let ty = self.resolve_value_type(&field.ty, &what, field.location, diagnostics);
            fields.push(FieldSymbol {
                name: field.name.clone(),
                ty,
                offset: fields.len() as u32 * FIELD_SIZE,
                is_public: field.is_public,
            });
        }

        let mut methods = Vec::new();
        for method in &class.methods {
            if duplicate(&method.name, method.location, diagnostics) {
                continue;
            }
            let mut param_names = BTreeSet::new();
            let mut params = Vec::new();
            for param in &method.params {
                if !param_names.insert(param.name.clone()) {
                    diagnostics.push(
                        Diagnostic::error(
                            codes::DUPLICATE_DEFINITION,
                            format!("parameter `{}` is declared more than once", param.name),
                        )
                        .at(param.location),
                    );
                }
                let what = format!("parameter `{}`", param.name);
                let ty = self.resolve_value_type(&param.ty, &what, param.location, diagnostics);
                params.push((param.name.clone(), ty));
            }
            methods.push(MethodSymbol {
                name: method.name.clone(),
                is_static: method.is_static,
                is_public: method.is_public,
                params,
                returns: self.resolve_type(&method.return_ty, method.location, diagnostics),
            });
        }

        (fields, methods)
    }

    pub fn own_classes(&self) -> impl Iterator<Item = &ClassSymbol> {
        self.classes.iter().filter(|c| c.own)
    }

    pub fn class(&self, id: &ClassId) -> Option<&ClassSymbol> {
        self.by_name
            .get(&id.name)?
            .iter()
            .map(|&i| &self.classes[i])
            .find(|c| c.id == *id)
    }

    pub fn own_class(&self, name: &str) -> Option<&ClassSymbol> {
        self.own_index(name).map(|i| &self.classes[i])
    }

    /// Whether `name` names any visible class, without reporting anything
    pub fn is_class_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Resolve a class name: own classes shadow referenced ones
    pub fn resolve_class(
        &self,
        name: &str,
        location: Location,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<&ClassSymbol> {
        let Some(candidates) = self.by_name.get(name) else {
            diagnostics.push(
                Diagnostic::error(
                    codes::UNKNOWN_TYPE,
                    format!("the type `{}` could not be found", name),
                )
                .at(location),
            );
            return None;
        };

        if let Some(own) = self.own_index(name) {
            return Some(&self.classes[own]);
        }

        let libraries: BTreeSet<&str> = candidates
            .iter()
            .map(|&i| self.classes[i].id.library.as_str())
            .collect();
        if libraries.len() > 1 {
            let list: Vec<&str> = libraries.into_iter().collect();
            diagnostics.push(
                Diagnostic::error(
                    codes::AMBIGUOUS_TYPE,
                    format!(
                        "`{}` is ambiguous between libraries {}",
                        name,
                        list.join(", ")
                    ),
                )
                .at(location),
            );
            return None;
        }

        let class = &self.classes[candidates[0]];
        if !class.is_public {
            diagnostics.push(
                Diagnostic::error(
                    codes::INACCESSIBLE,
                    format!(
                        "class `{}` of library `{}` is not public",
                        name, class.id.library
                    ),
                )
                .at(location),
            );
            return None;
        }
        Some(class)
    }

    pub fn resolve_type(
        &self,
        ty: &TypeName,
        location: Location,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Ty {
        match ty {
            TypeName::Int => Ty::Int,
            TypeName::Bool => Ty::Bool,
            TypeName::Void => Ty::Void,
            TypeName::Named(name) => match self.resolve_class(name, location, diagnostics) {
                Some(class) => Ty::Class(class.id.clone()),
                None => Ty::Error,
            },
        }
    }

    /// Resolve the type of a field, parameter or local, which cannot be void
    pub fn resolve_value_type(
        &self,
        ty: &TypeName,
        what: &str,
        location: Location,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Ty {
        match self.resolve_type(ty, location, diagnostics) {
            Ty::Void => {
                diagnostics.push(
                    Diagnostic::error(codes::TYPE_MISMATCH, format!("{} cannot have type void", what))
                        .at(location),
                );
                Ty::Error
            }
            ty => ty,
        }
    }
}
