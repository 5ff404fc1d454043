use crate::diagnostics::Location;

/// A parsed source file
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationUnit {
    pub classes: Vec<ClassDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub is_public: bool,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeName,
    pub init: Option<Expr>,
    pub is_public: bool,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub is_public: bool,
    pub is_static: bool,
    pub return_ty: TypeName,
    pub params: Vec<Param>,
    pub body: Body,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeName,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// `=> expr;`
    Expr(Expr),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Int,
    Bool,
    Void,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Local {
        ty: TypeName,
        name: String,
        init: Expr,
        location: Location,
    },
    Assign {
        target: Expr,
        value: Expr,
        location: Location,
    },
    Return {
        value: Option<Expr>,
        location: Location,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Expr(Expr),
}

impl Stmt {
    /// Whether control never falls through this statement
    pub fn always_returns(&self) -> bool {
        match self {
            Self::Return { .. } => true,
            Self::If {
                then_branch,
                else_branch: Some(else_branch),
                ..
            } => then_branch.always_returns() && else_branch.always_returns(),
            Self::Block(stmts) => stmts.iter().any(Stmt::always_returns),
            _ => false,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Local { location, .. }
            | Self::Assign { location, .. }
            | Self::Return { location, .. } => Some(*location),
            Self::If { cond, .. } | Self::While { cond, .. } => Some(cond.location),
            Self::Expr(expr) => Some(expr.location),
            Self::Block(stmts) => stmts.first().and_then(Stmt::location),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
}

impl Expr {
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Self { kind, location }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Bool(bool),
    Name(String),
    This,
    New(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}
