//! Type checking and lowering of a parsed unit to WebAssembly text.
//!
//! Every value is an `i32`: integers directly, booleans as 0/1 and objects as
//! pointers into the module's linear memory. Instance methods take the object
//! pointer as their first parameter. Classes of referenced libraries are
//! reached through function imports named `<Class>::<member>` from the module
//! named after the library.

use super::ast::*;
use super::symbols::{ClassSymbol, FieldSymbol, MethodSymbol, SymbolTable, Ty, FIELD_SIZE};
use super::EmitOptions;
use crate::config::{OptimizationLevel, OutputKind};
use crate::diagnostics::{codes, Diagnostic, Location};
use crate::image::{
    ClassInfo, FieldInfo, ImageMetadata, MethodInfo, ParamInfo, FORMAT_VERSION,
};
use std::collections::{BTreeMap, BTreeSet};

/// Export name of an executable's entry point
pub const ENTRY_EXPORT: &str = "__entry";

/// Heap start; address 0 stays unused so no object lives at null
const HEAP_BASE: u32 = 8;

const ALLOCATOR: &str = r#"  (func $__alloc (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr (global.get $__heap))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.shl (memory.size) (i32.const 16)))
      (then
        (if (i32.eq
              (memory.grow
                (i32.add
                  (i32.shr_u
                    (i32.sub (local.get $end) (i32.shl (memory.size) (i32.const 16)))
                    (i32.const 16))
                  (i32.const 1)))
              (i32.const -1))
          (then (unreachable)))))
    (global.set $__heap (local.get $end))
    (local.get $ptr))"#;

#[derive(Debug)]
pub(crate) struct LoweredModule {
    pub wat: String,
    pub metadata: ImageMetadata,
}

pub(crate) fn lower(
    unit: &CompilationUnit,
    symbols: &SymbolTable,
    options: &EmitOptions,
    diagnostics: &mut Vec<Diagnostic>,
) -> LoweredModule {
    let mut lowering = Lowering {
        symbols,
        fold: options.optimization_level == OptimizationLevel::Release,
        diagnostics,
        imports: BTreeMap::new(),
        dependencies: BTreeSet::new(),
        functions: Vec::new(),
    };

    let mut lowered_classes = BTreeSet::new();
    for decl in &unit.classes {
        if !lowered_classes.insert(decl.name.as_str()) {
            continue;
        }
        let Some(class) = symbols.own_class(&decl.name) else {
            continue;
        };
        lowering.lower_class(class, decl);
    }

    let entry_point = match options.output_kind {
        OutputKind::Executable => lowering.entry_point(unit),
        OutputKind::DynamicLibrary => None,
    };

    let mut wat = String::from("(module\n");
    for import in lowering.imports.values() {
        wat.push_str("  ");
        wat.push_str(import);
        wat.push('\n');
    }
    wat.push_str("  (memory (export \"memory\") 1)\n");
    wat.push_str(&format!(
        "  (global $__heap (mut i32) (i32.const {}))\n",
        HEAP_BASE
    ));
    wat.push_str(ALLOCATOR);
    wat.push('\n');
    for function in &lowering.functions {
        wat.push_str(function);
        wat.push('\n');
    }
    if let Some((class, _)) = &entry_point {
        wat.push_str(&format!(
            "  (export \"{}\" (func ${}::Main))\n",
            ENTRY_EXPORT, class
        ));
    }
    wat.push_str(")\n");

    let metadata = ImageMetadata {
        name: options.target_name.clone(),
        format_version: FORMAT_VERSION,
        language_version: options.language_version,
        output_kind: options.output_kind,
        optimization_level: options.optimization_level,
        entry_point: entry_point.map(|(_, export)| export),
        classes: symbols.own_classes().map(class_info).collect(),
        dependencies: lowering.dependencies.into_iter().collect(),
    };

    LoweredModule { wat, metadata }
}

fn class_info(class: &ClassSymbol) -> ClassInfo {
    ClassInfo {
        name: class.id.name.clone(),
        is_public: class.is_public,
        size: class.size,
        fields: class
            .fields
            .iter()
            .map(|f| FieldInfo {
                name: f.name.clone(),
                ty: f.ty.to_type_ref(),
                offset: f.offset,
                is_public: f.is_public,
            })
            .collect(),
        methods: class
            .methods
            .iter()
            .map(|m| MethodInfo {
                name: m.name.clone(),
                is_static: m.is_static,
                is_public: m.is_public,
                params: m
                    .params
                    .iter()
                    .map(|(name, ty)| ParamInfo {
                        name: name.clone(),
                        ty: ty.to_type_ref(),
                    })
                    .collect(),
                returns: m.returns.to_type_ref(),
            })
            .collect(),
    }
}

/// What `this` means inside the code being lowered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiver {
    Instance,
    Static,
    /// Field initializers run inside the constructor but cannot see `this`
    Initializer,
}

#[derive(Debug)]
struct Local {
    name: String,
    slot: String,
    ty: Ty,
    used: bool,
    location: Location,
}

struct FunctionScope<'a> {
    class: &'a ClassSymbol,
    receiver: Receiver,
    returns: Ty,
    params: Vec<(String, Ty)>,
    scopes: Vec<Vec<Local>>,
    slots: Vec<String>,
    labels: u32,
}

impl<'a> FunctionScope<'a> {
    fn new(class: &'a ClassSymbol, receiver: Receiver, returns: Ty, params: Vec<(String, Ty)>) -> Self {
        Self {
            class,
            receiver,
            returns,
            params,
            scopes: Vec::new(),
            slots: Vec::new(),
            labels: 0,
        }
    }

    fn local(&mut self, name: &str) -> Option<&mut Local> {
        self.scopes
            .iter_mut()
            .rev()
            .flat_map(|scope| scope.iter_mut().rev())
            .find(|local| local.name == name)
    }

    fn param(&self, name: &str) -> Option<&Ty> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, ty)| ty)
    }

    fn is_variable(&self, name: &str) -> bool {
        self.param(name).is_some()
            || self
                .scopes
                .iter()
                .any(|scope| scope.iter().any(|local| local.name == name))
    }

    fn declare(&mut self, name: &str, ty: Ty, location: Location) -> String {
        let slot = format!("${}_{}", name, self.slots.len());
        self.slots.push(slot.clone());
        if self.scopes.is_empty() {
            self.scopes.push(Vec::new());
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.to_string(),
                slot: slot.clone(),
                ty,
                used: false,
                location,
            });
        }
        slot
    }

    fn next_label(&mut self) -> u32 {
        self.labels += 1;
        self.labels
    }
}

/// A lowered expression
#[derive(Debug)]
struct Operand {
    ty: Ty,
    code: String,
    /// Known value, for folding
    constant: Option<i32>,
}

impl Operand {
    fn new(ty: Ty, code: String) -> Self {
        Self {
            ty,
            code,
            constant: None,
        }
    }

    fn constant(ty: Ty, value: i32) -> Self {
        Self {
            ty,
            code: format!("(i32.const {})", value),
            constant: Some(value),
        }
    }

    fn error() -> Self {
        Self::new(Ty::Error, "(unreachable)".to_string())
    }
}

/// How the left side of a `.` resolves
enum Target<'a> {
    Type(&'a ClassSymbol),
    Value,
    Invalid,
}

struct Lowering<'a, 'd> {
    symbols: &'a SymbolTable,
    fold: bool,
    diagnostics: &'d mut Vec<Diagnostic>,
    /// Keyed by function id so the import section is sorted and deduplicated
    imports: BTreeMap<String, String>,
    dependencies: BTreeSet<String>,
    functions: Vec<String>,
}

impl<'a, 'd> Lowering<'a, 'd> {
    fn error(&mut self, code: &str, message: String, location: Location) {
        self.diagnostics
            .push(Diagnostic::error(code, message).at(location));
    }

    fn warn(&mut self, code: &str, message: String, location: Location) {
        self.diagnostics
            .push(Diagnostic::warning(code, message).at(location));
    }

    fn expect_type(&mut self, expected: &Ty, found: &Ty, location: Location, context: &str) {
        if expected.is_error() || found.is_error() || expected == found {
            return;
        }
        self.error(
            codes::TYPE_MISMATCH,
            format!("{}: expected `{}`, found `{}`", context, expected, found),
            location,
        );
    }

    fn import(&mut self, class: &ClassSymbol, member: &str, params: usize, has_result: bool) -> String {
        let id = format!("${}/{}::{}", class.id.library, class.id.name, member);
        self.dependencies.insert(class.id.library.clone());
        self.imports.entry(id.clone()).or_insert_with(|| {
            let mut signature = String::new();
            for _ in 0..params {
                signature.push_str(" (param i32)");
            }
            if has_result {
                signature.push_str(" (result i32)");
            }
            format!(
                "(import \"{}\" \"{}::{}\" (func {}{}))",
                class.id.library, class.id.name, member, id, signature
            )
        });
        id
    }

    // ---- declarations ----

    fn lower_class(&mut self, class: &'a ClassSymbol, decl: &ClassDecl) {
        self.lower_constructor(class, decl);

        let mut seen = BTreeSet::new();
        for method in &decl.methods {
            if !seen.insert(method.name.as_str()) {
                continue;
            }
            if let Some(symbol) = class.method(&method.name) {
                self.lower_method(class, symbol, method);
            }
        }
    }

    fn lower_constructor(&mut self, class: &'a ClassSymbol, decl: &ClassDecl) {
        let mut f = FunctionScope::new(class, Receiver::Initializer, Ty::Void, Vec::new());
        let mut body = vec![format!(
            "(local.set $this (call $__alloc (i32.const {})))",
            class.size.max(FIELD_SIZE)
        )];

        let mut seen = BTreeSet::new();
        for field_decl in &decl.fields {
            if !seen.insert(field_decl.name.as_str()) {
                continue;
            }
            let Some(field) = class.field(&field_decl.name) else {
                continue;
            };
            match &field_decl.init {
                Some(init) => {
                    let value = self.lower_expr(&mut f, init);
                    self.expect_type(
                        &field.ty,
                        &value.ty,
                        init.location,
                        &format!("initializer of field `{}`", field.name),
                    );
                    body.push(format!(
                        "(i32.store offset={} (local.get $this) {})",
                        field.offset, value.code
                    ));
                }
                None if matches!(field.ty, Ty::Class(_)) => self.error(
                    codes::UNINITIALIZED_FIELD,
                    format!(
                        "field `{}` of class type `{}` must have an initializer",
                        field.name, field.ty
                    ),
                    field_decl.location,
                ),
                // Fresh heap memory is zeroed
                None => {}
            }
        }
        body.push("(local.get $this)".to_string());

        let name = format!("{}::new", class.id.name);
        self.push_function(&name, " (result i32)", &["$this".to_string()], body);
    }

    fn push_function(&mut self, name: &str, signature: &str, locals: &[String], body: Vec<String>) {
        let mut text = format!("  (func ${} (export \"{}\"){}", name, name, signature);
        for slot in locals {
            text.push_str(&format!("\n    (local {} i32)", slot));
        }
        for line in body {
            text.push_str("\n    ");
            text.push_str(&line);
        }
        text.push(')');
        self.functions.push(text);
    }

    fn lower_method(&mut self, class: &'a ClassSymbol, method: &'a MethodSymbol, decl: &MethodDecl) {
        let receiver = if method.is_static {
            Receiver::Static
        } else {
            Receiver::Instance
        };
        let mut f = FunctionScope::new(class, receiver, method.returns.clone(), method.params.clone());
        let mut body = Vec::new();

        match &decl.body {
            Body::Expr(expr) if method.returns == Ty::Void => {
                self.lower_expr_stmt(&mut f, expr, &mut body);
            }
            Body::Expr(expr) => {
                let value = self.lower_expr(&mut f, expr);
                self.expect_type(&method.returns, &value.ty, expr.location, "return value");
                body.push(value.code);
            }
            Body::Block(stmts) => {
                self.lower_block(&mut f, stmts, &mut body);
                if method.returns != Ty::Void {
                    if !method.returns.is_error() && !stmts.iter().any(Stmt::always_returns) {
                        self.error(
                            codes::MISSING_RETURN,
                            format!("`{}.{}`: not all code paths return a value", class.id.name, method.name),
                            decl.location,
                        );
                    }
                    body.push("(unreachable)".to_string());
                }
            }
        }

        let mut signature = String::new();
        if !method.is_static {
            signature.push_str(" (param $this i32)");
        }
        for (param, _) in &method.params {
            signature.push_str(&format!(" (param $p_{} i32)", param));
        }
        if method.returns != Ty::Void {
            signature.push_str(" (result i32)");
        }
        let name = format!("{}::{}", class.id.name, method.name);
        self.push_function(&name, &signature, &f.slots, body);
    }

    /// Find the single `static Main` of an executable. Returns the declaring
    /// class and the export name.
    fn entry_point(&mut self, unit: &CompilationUnit) -> Option<(String, String)> {
        let candidates: Vec<(&ClassDecl, &MethodDecl)> = unit
            .classes
            .iter()
            .flat_map(|class| {
                class
                    .methods
                    .iter()
                    .filter(|m| m.is_static && m.name == "Main")
                    .map(move |m| (class, m))
            })
            .collect();

        match candidates.as_slice() {
            [] => {
                self.diagnostics.push(Diagnostic::error(
                    codes::ENTRY_POINT,
                    "program does not contain a static `Main` method suitable for an entry point",
                ));
                None
            }
            [(class, method)] => {
                let valid = method.params.is_empty()
                    && matches!(method.return_ty, TypeName::Int | TypeName::Void);
                if !valid {
                    self.error(
                        codes::ENTRY_POINT,
                        "`Main` must take no parameters and return int or void".to_string(),
                        method.location,
                    );
                    return None;
                }
                Some((class.name.clone(), ENTRY_EXPORT.to_string()))
            }
            [_, rest @ ..] => {
                for (_, method) in rest {
                    self.error(
                        codes::ENTRY_POINT,
                        "program has more than one entry point defined".to_string(),
                        method.location,
                    );
                }
                None
            }
        }
    }

    // ---- statements ----

    fn lower_block(&mut self, f: &mut FunctionScope<'a>, stmts: &[Stmt], out: &mut Vec<String>) {
        f.scopes.push(Vec::new());
        let mut terminated = false;
        let mut warned = false;
        for stmt in stmts {
            if terminated && !warned {
                if let Some(location) = stmt.location() {
                    self.warn(
                        codes::UNREACHABLE_CODE,
                        "unreachable code detected".to_string(),
                        location,
                    );
                }
                warned = true;
            }
            self.lower_stmt(f, stmt, out);
            terminated |= stmt.always_returns();
        }
        self.close_scope(f);
    }

    fn close_scope(&mut self, f: &mut FunctionScope<'a>) {
        let Some(scope) = f.scopes.pop() else {
            return;
        };
        for local in scope.into_iter().filter(|local| !local.used) {
            self.warn(
                codes::UNUSED_VARIABLE,
                format!("the variable `{}` is assigned but its value is never used", local.name),
                local.location,
            );
        }
    }

    /// Lower the body of an `if` or `while` in its own scope
    fn lower_embedded(&mut self, f: &mut FunctionScope<'a>, stmt: &Stmt) -> String {
        let mut out = Vec::new();
        match stmt {
            Stmt::Block(stmts) => self.lower_block(f, stmts, &mut out),
            other => {
                f.scopes.push(Vec::new());
                self.lower_stmt(f, other, &mut out);
                self.close_scope(f);
            }
        }
        out.join(" ")
    }

    fn lower_stmt(&mut self, f: &mut FunctionScope<'a>, stmt: &Stmt, out: &mut Vec<String>) {
        match stmt {
            Stmt::Local {
                ty,
                name,
                init,
                location,
            } => {
                let what = format!("variable `{}`", name);
                let ty = self
                    .symbols
                    .resolve_value_type(ty, &what, *location, self.diagnostics);
                if f.is_variable(name) {
                    self.error(
                        codes::DUPLICATE_DEFINITION,
                        format!("a local or parameter named `{}` is already defined in this scope", name),
                        *location,
                    );
                }
                let value = self.lower_expr(f, init);
                self.expect_type(&ty, &value.ty, init.location, &format!("initializer of `{}`", name));
                let slot = f.declare(name, ty, *location);
                out.push(format!("(local.set {} {})", slot, value.code));
            }
            Stmt::Assign {
                target,
                value,
                location,
            } => self.lower_assign(f, target, value, *location, out),
            Stmt::Return { value, location } => {
                let returns = f.returns.clone();
                match value {
                    None if returns == Ty::Void || returns.is_error() => {
                        out.push("(return)".to_string())
                    }
                    None => self.error(
                        codes::TYPE_MISMATCH,
                        format!("method must return a value of type `{}`", returns),
                        *location,
                    ),
                    Some(expr) => {
                        let operand = self.lower_expr(f, expr);
                        if returns == Ty::Void {
                            self.error(
                                codes::TYPE_MISMATCH,
                                "a void method cannot return a value".to_string(),
                                expr.location,
                            );
                        } else {
                            self.expect_type(&returns, &operand.ty, expr.location, "return value");
                        }
                        out.push(format!("(return {})", operand.code));
                    }
                }
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let condition = self.lower_expr(f, cond);
                self.expect_type(&Ty::Bool, &condition.ty, cond.location, "condition");
                let then_code = self.lower_embedded(f, then_branch);
                let else_code = match else_branch {
                    Some(branch) => self.lower_embedded(f, branch),
                    None => String::new(),
                };
                match condition.constant.filter(|_| self.fold) {
                    Some(0) if !else_code.is_empty() => out.push(else_code),
                    Some(0) => {}
                    Some(_) if !then_code.is_empty() => out.push(then_code),
                    Some(_) => {}
                    None => out.push(format!(
                        "(if {} (then {}) (else {}))",
                        condition.code, then_code, else_code
                    )),
                }
            }
            Stmt::While { cond, body } => {
                let condition = self.lower_expr(f, cond);
                self.expect_type(&Ty::Bool, &condition.ty, cond.location, "condition");
                let label = f.next_label();
                let body = self.lower_embedded(f, body);
                out.push(format!(
                    "(block $exit_{l} (loop $loop_{l} (br_if $exit_{l} (i32.eqz {c})) {b} (br $loop_{l})))",
                    l = label,
                    c = condition.code,
                    b = body
                ));
            }
            Stmt::Block(stmts) => {
                let mut inner = Vec::new();
                self.lower_block(f, stmts, &mut inner);
                out.extend(inner);
            }
            Stmt::Expr(expr) => self.lower_expr_stmt(f, expr, out),
        }
    }

    fn lower_expr_stmt(&mut self, f: &mut FunctionScope<'a>, expr: &Expr, out: &mut Vec<String>) {
        if !matches!(expr.kind, ExprKind::Call(..) | ExprKind::New(_)) {
            self.error(
                codes::INVALID_STATEMENT,
                "only call and `new` expressions can be used as a statement".to_string(),
                expr.location,
            );
        }
        let operand = self.lower_expr(f, expr);
        if operand.ty == Ty::Void {
            out.push(operand.code);
        } else {
            out.push(format!("(drop {})", operand.code));
        }
    }

    fn lower_assign(
        &mut self,
        f: &mut FunctionScope<'a>,
        target: &Expr,
        value: &Expr,
        location: Location,
        out: &mut Vec<String>,
    ) {
        let operand = self.lower_expr(f, value);

        match &target.kind {
            ExprKind::Name(name) => {
                if let Some(local) = f.local(name) {
                    let (slot, ty) = (local.slot.clone(), local.ty.clone());
                    self.expect_type(&ty, &operand.ty, value.location, "assignment");
                    out.push(format!("(local.set {} {})", slot, operand.code));
                } else if let Some(ty) = f.param(name).cloned() {
                    self.expect_type(&ty, &operand.ty, value.location, "assignment");
                    out.push(format!("(local.set $p_{} {})", name, operand.code));
                } else if let Some(field) = f.class.field(name) {
                    if f.receiver != Receiver::Instance {
                        self.error(
                            codes::STATIC_CONTEXT,
                            format!("instance field `{}` cannot be used without an object", name),
                            target.location,
                        );
                        return;
                    }
                    self.expect_type(&field.ty, &operand.ty, value.location, "assignment");
                    out.push(format!(
                        "(i32.store offset={} (local.get $this) {})",
                        field.offset, operand.code
                    ));
                } else if self.symbols.is_class_name(name) {
                    self.error(
                        codes::INVALID_ASSIGNMENT,
                        format!("`{}` is a type and cannot be assigned to", name),
                        location,
                    );
                } else {
                    self.error(
                        codes::UNKNOWN_NAME,
                        format!("the name `{}` does not exist in the current context", name),
                        target.location,
                    );
                }
            }
            ExprKind::Member(object, field_name) => {
                let Some((object, field)) = self.member(f, object, field_name, target.location)
                else {
                    return;
                };
                self.expect_type(&field.ty, &operand.ty, value.location, "assignment");
                out.push(format!(
                    "(i32.store offset={} {} {})",
                    field.offset, object.code, operand.code
                ));
            }
            _ => self.error(
                codes::INVALID_ASSIGNMENT,
                "the left-hand side of an assignment must be a variable or field".to_string(),
                location,
            ),
        }
    }

    // ---- expressions ----

    fn lower_expr(&mut self, f: &mut FunctionScope<'a>, expr: &Expr) -> Operand {
        match &expr.kind {
            ExprKind::Int(value) => match i32::try_from(*value) {
                Ok(value) => Operand::constant(Ty::Int, value),
                Err(_) => {
                    self.error(
                        codes::INTEGER_OVERFLOW,
                        format!("integer literal `{}` does not fit in an int", value),
                        expr.location,
                    );
                    Operand::error()
                }
            },
            ExprKind::Bool(value) => Operand::constant(Ty::Bool, i32::from(*value)),
            ExprKind::Name(name) => self.lower_name(f, name, expr.location),
            ExprKind::This => match f.receiver {
                Receiver::Instance => {
                    Operand::new(Ty::Class(f.class.id.clone()), "(local.get $this)".to_string())
                }
                _ => {
                    self.error(
                        codes::STATIC_CONTEXT,
                        "`this` is not available in a static context".to_string(),
                        expr.location,
                    );
                    Operand::error()
                }
            },
            ExprKind::New(name) => {
                let symbols = self.symbols;
                let Some(class) = symbols.resolve_class(name, expr.location, self.diagnostics) else {
                    return Operand::error();
                };
                let func = if class.own {
                    format!("${}::new", class.id.name)
                } else {
                    self.import(class, "new", 0, true)
                };
                Operand::new(Ty::Class(class.id.clone()), format!("(call {})", func))
            }
            ExprKind::Unary(op, inner) => self.lower_unary(f, *op, inner),
            ExprKind::Binary(op, lhs, rhs) => self.lower_binary(f, *op, lhs, rhs, expr.location),
            ExprKind::Member(object, field_name) => {
                match self.member(f, object, field_name, expr.location) {
                    Some((object, field)) => Operand::new(
                        field.ty.clone(),
                        format!("(i32.load offset={} {})", field.offset, object.code),
                    ),
                    None => Operand::error(),
                }
            }
            ExprKind::Call(callee, args) => self.lower_call(f, callee, args, expr.location),
        }
    }

    fn lower_name(&mut self, f: &mut FunctionScope<'a>, name: &str, location: Location) -> Operand {
        if let Some(local) = f.local(name) {
            local.used = true;
            return Operand::new(local.ty.clone(), format!("(local.get {})", local.slot));
        }
        if let Some(ty) = f.param(name) {
            return Operand::new(ty.clone(), format!("(local.get $p_{})", name));
        }
        if let Some(field) = f.class.field(name) {
            if f.receiver != Receiver::Instance {
                self.error(
                    codes::STATIC_CONTEXT,
                    format!("instance field `{}` cannot be used without an object", name),
                    location,
                );
                return Operand::error();
            }
            return Operand::new(
                field.ty.clone(),
                format!("(i32.load offset={} (local.get $this))", field.offset),
            );
        }
        let message = if self.symbols.is_class_name(name) {
            format!("`{}` is a type and cannot be used as a value", name)
        } else {
            format!("the name `{}` does not exist in the current context", name)
        };
        self.error(codes::UNKNOWN_NAME, message, location);
        Operand::error()
    }

    fn lower_unary(&mut self, f: &mut FunctionScope<'a>, op: UnaryOp, inner: &Expr) -> Operand {
        // The most negative int is only expressible as a negated literal
        if op == UnaryOp::Neg && inner.kind == ExprKind::Int(i64::from(i32::MAX) + 1) {
            return Operand::constant(Ty::Int, i32::MIN);
        }

        let operand = self.lower_expr(f, inner);
        let (ty, code, folded) = match op {
            UnaryOp::Neg => {
                self.expect_type(&Ty::Int, &operand.ty, inner.location, "operand of `-`");
                (
                    Ty::Int,
                    format!("(i32.sub (i32.const 0) {})", operand.code),
                    operand.constant.map(i32::wrapping_neg),
                )
            }
            UnaryOp::Not => {
                self.expect_type(&Ty::Bool, &operand.ty, inner.location, "operand of `!`");
                (
                    Ty::Bool,
                    format!("(i32.eqz {})", operand.code),
                    operand.constant.map(|v| i32::from(v == 0)),
                )
            }
        };
        match folded.filter(|_| self.fold) {
            Some(value) => Operand::constant(ty, value),
            None => Operand::new(ty, code),
        }
    }

    fn lower_binary(
        &mut self,
        f: &mut FunctionScope<'a>,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        location: Location,
    ) -> Operand {
        let left = self.lower_expr(f, lhs);
        let right = self.lower_expr(f, rhs);
        let context = format!("operand of `{}`", op.symbol());

        let (ty, code) = match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Rem
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                self.expect_type(&Ty::Int, &left.ty, lhs.location, &context);
                self.expect_type(&Ty::Int, &right.ty, rhs.location, &context);
                let (ty, instr) = match op {
                    BinaryOp::Add => (Ty::Int, "i32.add"),
                    BinaryOp::Sub => (Ty::Int, "i32.sub"),
                    BinaryOp::Mul => (Ty::Int, "i32.mul"),
                    BinaryOp::Div => (Ty::Int, "i32.div_s"),
                    BinaryOp::Rem => (Ty::Int, "i32.rem_s"),
                    BinaryOp::Lt => (Ty::Bool, "i32.lt_s"),
                    BinaryOp::Le => (Ty::Bool, "i32.le_s"),
                    BinaryOp::Gt => (Ty::Bool, "i32.gt_s"),
                    _ => (Ty::Bool, "i32.ge_s"),
                };
                (ty, format!("({} {} {})", instr, left.code, right.code))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let comparable = left.ty.is_error()
                    || right.ty.is_error()
                    || (left.ty == right.ty && left.ty != Ty::Void);
                if !comparable {
                    self.error(
                        codes::TYPE_MISMATCH,
                        format!(
                            "operator `{}` cannot compare `{}` and `{}`",
                            op.symbol(),
                            left.ty,
                            right.ty
                        ),
                        location,
                    );
                }
                let instr = if op == BinaryOp::Eq { "i32.eq" } else { "i32.ne" };
                (Ty::Bool, format!("({} {} {})", instr, left.code, right.code))
            }
            BinaryOp::And => {
                self.expect_type(&Ty::Bool, &left.ty, lhs.location, &context);
                self.expect_type(&Ty::Bool, &right.ty, rhs.location, &context);
                (
                    Ty::Bool,
                    format!(
                        "(if (result i32) {} (then {}) (else (i32.const 0)))",
                        left.code, right.code
                    ),
                )
            }
            BinaryOp::Or => {
                self.expect_type(&Ty::Bool, &left.ty, lhs.location, &context);
                self.expect_type(&Ty::Bool, &right.ty, rhs.location, &context);
                (
                    Ty::Bool,
                    format!(
                        "(if (result i32) {} (then (i32.const 1)) (else {}))",
                        left.code, right.code
                    ),
                )
            }
        };

        let folded = match (left.constant, right.constant) {
            (Some(a), Some(b)) if self.fold => fold_binary(op, a, b),
            _ => None,
        };
        match folded {
            Some(value) => Operand::constant(ty, value),
            None => Operand::new(ty, code),
        }
    }

    /// Decide whether the left side of `.` names a class or a value
    fn classify(&mut self, f: &FunctionScope<'a>, expr: &Expr) -> Target<'a> {
        let ExprKind::Name(name) = &expr.kind else {
            return Target::Value;
        };
        if f.is_variable(name) || f.class.field(name).is_some() || !self.symbols.is_class_name(name) {
            return Target::Value;
        }
        let symbols = self.symbols;
        match symbols.resolve_class(name, expr.location, self.diagnostics) {
            Some(class) => Target::Type(class),
            None => Target::Invalid,
        }
    }

    /// Lower `object.name` up to the field it refers to
    fn member(
        &mut self,
        f: &mut FunctionScope<'a>,
        object: &Expr,
        name: &str,
        location: Location,
    ) -> Option<(Operand, &'a FieldSymbol)> {
        match self.classify(f, object) {
            Target::Type(class) => {
                self.error(
                    codes::UNKNOWN_MEMBER,
                    format!("`{}` has no static field `{}`", class.id.name, name),
                    location,
                );
                None
            }
            Target::Invalid => None,
            Target::Value => {
                let object = self.lower_expr(f, object);
                let field = self.field_of(f, &object.ty, name, location)?;
                Some((object, field))
            }
        }
    }

    fn class_of(&mut self, ty: &Ty, location: Location) -> Option<&'a ClassSymbol> {
        match ty {
            Ty::Class(id) => {
                let symbols = self.symbols;
                let class = symbols.class(id);
                if class.is_none() {
                    self.error(
                        codes::UNKNOWN_TYPE,
                        format!(
                            "type `{}` of library `{}` is not available; add a reference to `{}`",
                            id.name, id.library, id.library
                        ),
                        location,
                    );
                }
                class
            }
            Ty::Error => None,
            other => {
                self.error(
                    codes::UNKNOWN_MEMBER,
                    format!("`{}` has no members", other),
                    location,
                );
                None
            }
        }
    }

    fn field_of(
        &mut self,
        f: &FunctionScope<'a>,
        ty: &Ty,
        name: &str,
        location: Location,
    ) -> Option<&'a FieldSymbol> {
        let class = self.class_of(ty, location)?;
        let Some(field) = class.field(name) else {
            self.error(
                codes::UNKNOWN_MEMBER,
                format!("`{}` does not contain a field `{}`", class.id.name, name),
                location,
            );
            return None;
        };
        if !class.own {
            self.error(
                codes::INACCESSIBLE,
                format!(
                    "field `{}.{}` belongs to library `{}` and cannot be accessed",
                    class.id.name, name, class.id.library
                ),
                location,
            );
            return None;
        }
        if !field.is_public && class.id != f.class.id {
            self.error(
                codes::INACCESSIBLE,
                format!("field `{}.{}` is private", class.id.name, name),
                location,
            );
            return None;
        }
        Some(field)
    }

    fn lower_call(
        &mut self,
        f: &mut FunctionScope<'a>,
        callee: &Expr,
        args: &[Expr],
        location: Location,
    ) -> Operand {
        let Some((class, method, receiver)) = self.callee(f, callee) else {
            // Still check the arguments for their own diagnostics
            for arg in args {
                self.lower_expr(f, arg);
            }
            return Operand::error();
        };

        if args.len() != method.params.len() {
            self.error(
                codes::ARGUMENT_COUNT,
                format!(
                    "`{}.{}` takes {} argument(s) but {} were supplied",
                    class.id.name,
                    method.name,
                    method.params.len(),
                    args.len()
                ),
                location,
            );
        }

        let mut code_args = Vec::with_capacity(args.len() + 1);
        code_args.extend(receiver);
        let receiver_count = code_args.len();
        for (index, arg) in args.iter().enumerate() {
            let operand = self.lower_expr(f, arg);
            if let Some((param, ty)) = method.params.get(index) {
                self.expect_type(ty, &operand.ty, arg.location, &format!("argument `{}`", param));
            }
            code_args.push(operand.code);
        }

        let func = if class.own {
            format!("${}::{}", class.id.name, method.name)
        } else {
            self.import(
                class,
                &method.name,
                method.params.len() + receiver_count,
                method.returns != Ty::Void,
            )
        };

        let mut code = format!("(call {}", func);
        for arg in code_args {
            code.push(' ');
            code.push_str(&arg);
        }
        code.push(')');
        Operand::new(method.returns.clone(), code)
    }

    /// Resolve the method a call expression targets, with its receiver code
    fn callee(
        &mut self,
        f: &mut FunctionScope<'a>,
        callee: &Expr,
    ) -> Option<(&'a ClassSymbol, &'a MethodSymbol, Option<String>)> {
        let location = callee.location;
        match &callee.kind {
            ExprKind::Name(name) => {
                let class = f.class;
                let Some(method) = class.method(name) else {
                    self.error(
                        codes::UNKNOWN_NAME,
                        format!("the name `{}` does not exist in the current context", name),
                        location,
                    );
                    return None;
                };
                if method.is_static {
                    return Some((class, method, None));
                }
                if f.receiver != Receiver::Instance {
                    self.error(
                        codes::STATIC_CONTEXT,
                        format!("an object reference is required for instance method `{}`", name),
                        location,
                    );
                    return None;
                }
                Some((class, method, Some("(local.get $this)".to_string())))
            }
            ExprKind::Member(target, name) => {
                let (class, receiver) = match self.classify(f, target) {
                    Target::Type(class) => (class, None),
                    Target::Invalid => return None,
                    Target::Value => {
                        let object = self.lower_expr(f, target);
                        (self.class_of(&object.ty, location)?, Some(object.code))
                    }
                };
                let method = self.method_of(f, class, name, location)?;
                if method.is_static == receiver.is_some() {
                    let message = if method.is_static {
                        format!(
                            "static method `{}.{}` cannot be called through an instance",
                            class.id.name, name
                        )
                    } else {
                        format!("instance method `{}.{}` requires an object", class.id.name, name)
                    };
                    self.error(codes::STATIC_MISMATCH, message, location);
                    return None;
                }
                Some((class, method, receiver))
            }
            _ => {
                self.error(
                    codes::TYPE_MISMATCH,
                    "expression cannot be called".to_string(),
                    location,
                );
                None
            }
        }
    }

    fn method_of(
        &mut self,
        f: &FunctionScope<'a>,
        class: &'a ClassSymbol,
        name: &str,
        location: Location,
    ) -> Option<&'a MethodSymbol> {
        let Some(method) = class.method(name) else {
            self.error(
                codes::UNKNOWN_MEMBER,
                format!("`{}` does not contain a method `{}`", class.id.name, name),
                location,
            );
            return None;
        };
        let visible = method.is_public || (class.own && class.id == f.class.id);
        if !visible || (!class.own && !class.is_public) {
            self.error(
                codes::INACCESSIBLE,
                format!("method `{}.{}` is inaccessible here", class.id.name, name),
                location,
            );
            return None;
        }
        Some(method)
    }
}

fn fold_binary(op: BinaryOp, a: i32, b: i32) -> Option<i32> {
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        // Division by zero and overflow keep their runtime trap
        BinaryOp::Div => a.checked_div(b)?,
        BinaryOp::Rem => a.checked_rem(b)?,
        BinaryOp::Eq => i32::from(a == b),
        BinaryOp::Ne => i32::from(a != b),
        BinaryOp::Lt => i32::from(a < b),
        BinaryOp::Le => i32::from(a <= b),
        BinaryOp::Gt => i32::from(a > b),
        BinaryOp::Ge => i32::from(a >= b),
        BinaryOp::And => i32::from(a != 0 && b != 0),
        BinaryOp::Or => i32::from(a != 0 || b != 0),
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageVersion;
    use crate::diagnostics::has_errors;
    use crate::frontend::parser::parse;
    use crate::runtime::core_reference;

    fn lower_with(
        source: &str,
        output_kind: OutputKind,
        optimization_level: OptimizationLevel,
    ) -> (LoweredModule, Vec<Diagnostic>) {
        let unit = parse(source, LanguageVersion::V2).unwrap();
        let mut diagnostics = Vec::new();
        let symbols = SymbolTable::build(&unit, "App", &[core_reference()], &mut diagnostics);
        let options = EmitOptions {
            target_name: "App".to_string(),
            output_kind,
            optimization_level,
            language_version: LanguageVersion::V2,
        };
        let module = lower(&unit, &symbols, &options, &mut diagnostics);
        (module, diagnostics)
    }

    fn lower_library(source: &str) -> (LoweredModule, Vec<Diagnostic>) {
        lower_with(source, OutputKind::DynamicLibrary, OptimizationLevel::Release)
    }

    fn codes_of(diagnostics: &[Diagnostic]) -> Vec<&str> {
        diagnostics.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_release_folds_constants() {
        let source = "class C { int F() => 2 + 2; }";
        let (release, diagnostics) = lower_library(source);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert!(!release.wat.contains("(i32.add (i32.const 2) (i32.const 2))"));
        assert!(release.wat.contains("(i32.const 4)"));

        let (debug, _) = lower_with(source, OutputKind::DynamicLibrary, OptimizationLevel::Debug);
        assert!(debug.wat.contains("(i32.add (i32.const 2) (i32.const 2))"));
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        let (module, _) = lower_library("class C { int F() => 1 / 0; }");
        assert!(module.wat.contains("(i32.div_s (i32.const 1) (i32.const 0))"));
    }

    #[test]
    fn test_foreign_calls_become_imports() {
        let (module, diagnostics) = lower_library("class C { int F() => Math.Max(1, 2); }");
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert!(module.wat.contains(
            "(import \"core\" \"Math::Max\" (func $core/Math::Max (param i32) (param i32) (result i32)))"
        ));
        assert_eq!(module.metadata.dependencies, vec!["core".to_string()]);
    }

    #[test]
    fn test_metadata_describes_classes() {
        let (module, _) =
            lower_library("public class P { public int x; public int Get() => x; static bool B() => true; }");
        let class = module.metadata.class("P").unwrap();
        assert_eq!(class.size, 4);
        assert!(!class.method("Get").unwrap().is_static);
        assert!(class.method("B").unwrap().is_static);
        assert!(module.metadata.entry_point.is_none());
        assert!(module.metadata.dependencies.is_empty());
    }

    #[test]
    fn test_semantic_errors() {
        let cases = [
            ("class C { int x; static int F() => x; }", codes::STATIC_CONTEXT),
            ("class C { C next; }", codes::UNINITIALIZED_FIELD),
            ("class C { int F() { if (true) { return 1; } } }", codes::MISSING_RETURN),
            ("class C { void F() { 1 + 2; } }", codes::INVALID_STATEMENT),
            ("class C { int F() => 3000000000; }", codes::INTEGER_OVERFLOW),
            ("class C { int F() => true; }", codes::TYPE_MISMATCH),
            ("class C { int F() => y; }", codes::UNKNOWN_NAME),
            ("class C { int F() => Math.Nope(); }", codes::UNKNOWN_MEMBER),
            ("class C { int F() => Math.Abs(1, 2); }", codes::ARGUMENT_COUNT),
            ("class C { int F(int a) { int a = 1; return a; } }", codes::DUPLICATE_DEFINITION),
            ("class C { int F() => G(); int G() => 1; static int H() => G(); }", codes::STATIC_CONTEXT),
            ("class C { static int S() => 1; int F() => this.S(); }", codes::STATIC_MISMATCH),
            ("class C { int F() => C.G(); int G() => 1; }", codes::STATIC_MISMATCH),
            ("class C { void F() { 1 = 2; } }", codes::INVALID_ASSIGNMENT),
        ];
        for (source, code) in cases {
            let (_, diagnostics) = lower_library(source);
            assert!(
                codes_of(&diagnostics).contains(&code),
                "expected {} for `{}`, got {:?}",
                code,
                source,
                diagnostics
            );
        }
    }

    #[test]
    fn test_private_members_of_other_classes() {
        let (_, diagnostics) = lower_library(
            "class A { int secret; int Hidden() => 1; } \
             class B { int F() { A a = new A(); return a.secret + a.Hidden(); } }",
        );
        let found = codes_of(&diagnostics);
        assert_eq!(found.iter().filter(|c| **c == codes::INACCESSIBLE).count(), 2);
    }

    #[test]
    fn test_warnings() {
        let (_, diagnostics) =
            lower_library("class C { int F() { int unused = 1; return 2; return 3; } }");
        let found = codes_of(&diagnostics);
        assert!(found.contains(&codes::UNUSED_VARIABLE));
        assert!(found.contains(&codes::UNREACHABLE_CODE));
        assert!(!has_errors(&diagnostics));
    }

    #[test]
    fn test_entry_point() {
        let (module, diagnostics) = lower_with(
            "class P { static int Main() => 7; }",
            OutputKind::Executable,
            OptimizationLevel::Release,
        );
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert_eq!(module.metadata.entry_point.as_deref(), Some(ENTRY_EXPORT));
        assert!(module.wat.contains("(export \"__entry\" (func $P::Main))"));

        let (_, missing) = lower_with(
            "class P { static int Run() => 7; }",
            OutputKind::Executable,
            OptimizationLevel::Release,
        );
        assert_eq!(codes_of(&missing), vec![codes::ENTRY_POINT]);

        let (_, twice) = lower_with(
            "class P { static int Main() => 7; } class Q { static void Main() { } }",
            OutputKind::Executable,
            OptimizationLevel::Release,
        );
        assert_eq!(codes_of(&twice), vec![codes::ENTRY_POINT]);
    }

    #[test]
    fn test_most_negative_literal() {
        let (module, diagnostics) = lower_library("class C { int F() => -2147483648; }");
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert!(module.wat.contains("(i32.const -2147483648)"));
    }

    #[test]
    fn test_lowered_module_executes() {
        let source = r#"
            public class Counter {
                public int total = 0;
                public int step = 3;
                public int Run(int times) {
                    int i = 0;
                    while (i < times) {
                        total = total + step;
                        i = i + 1;
                    }
                    if (total > 10 && !(total == 0)) {
                        return total;
                    }
                    return -1;
                }
            }
        "#;
        let (module, diagnostics) = lower_library(source);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);

        let bytes = wat::parse_str(&module.wat).unwrap();
        let engine = wasmtime::Engine::default();
        let compiled = wasmtime::Module::new(&engine, &bytes).unwrap();
        let mut store = wasmtime::Store::new(&engine, ());
        let instance = wasmtime::Instance::new(&mut store, &compiled, &[]).unwrap();

        let new = instance
            .get_typed_func::<(), i32>(&mut store, "Counter::new")
            .unwrap();
        let run = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "Counter::Run")
            .unwrap();
        let counter = new.call(&mut store, ()).unwrap();
        assert_eq!(run.call(&mut store, (counter, 5)).unwrap(), 15);

        let fresh = new.call(&mut store, ()).unwrap();
        assert_ne!(fresh, counter);
        assert_eq!(run.call(&mut store, (fresh, 1)).unwrap(), -1);
    }
}
