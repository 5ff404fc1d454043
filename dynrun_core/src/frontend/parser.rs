use super::ast::*;
use super::lexer::{lex, Token, TokenKind};
use crate::config::LanguageVersion;
use crate::diagnostics::{codes, Diagnostic, Location};

type ParseResult<T> = Result<T, Diagnostic>;

/// Deepest nesting of statements and expressions the parser accepts
pub const MAX_NESTING: usize = 128;

pub fn parse(source: &str, version: LanguageVersion) -> Result<CompilationUnit, Vec<Diagnostic>> {
    let tokens = lex(source)?;
    Parser::new(tokens, version).parse()
}

#[derive(Debug, Default)]
struct Modifiers {
    is_public: bool,
    is_private: bool,
    is_static: bool,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    version: LanguageVersion,
    errors: Vec<Diagnostic>,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, version: LanguageVersion) -> Self {
        Self {
            tokens,
            pos: 0,
            version,
            errors: Vec::new(),
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<CompilationUnit, Vec<Diagnostic>> {
        if self.is_eof() {
            return Err(vec![Diagnostic::error(
                codes::EMPTY_SOURCE,
                "source contains no declarations",
            )
            .at(self.location())]);
        }

        let mut classes = Vec::new();
        while !self.is_eof() {
            match self.parse_class() {
                Ok(class) => classes.push(class),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize_class();
                }
            }
        }

        if self.errors.is_empty() {
            Ok(CompilationUnit { classes })
        } else {
            Err(self.errors)
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn location(&self) -> Location {
        self.tokens[self.pos.min(self.tokens.len() - 1)].location
    }

    fn is_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if !self.is_eof() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.describe()))
        }
    }

    fn expect_ident(&mut self) -> ParseResult<(String, Location)> {
        let location = self.location();
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, location))
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        Diagnostic::error(
            codes::UNEXPECTED_TOKEN,
            format!("expected {}, found {}", expected, self.peek().describe()),
        )
        .at(self.location())
    }

    fn require_version(&mut self, feature: &str, location: Location) {
        if self.version < LanguageVersion::V2 {
            self.errors.push(
                Diagnostic::error(
                    codes::FEATURE_UNAVAILABLE,
                    format!("{} require language version v2", feature),
                )
                .at(location),
            );
        }
    }

    fn synchronize_class(&mut self) {
        while !self.is_eof() {
            if matches!(self.peek(), TokenKind::Class | TokenKind::Public)
                && matches!(self.peek_at(1), TokenKind::Class | TokenKind::Ident(_))
            {
                return;
            }
            self.advance();
        }
    }

    /// Skip to the end of the current statement or member
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::Semi if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ---- declarations ----

    fn parse_modifiers(&mut self) -> Modifiers {
        let mut modifiers = Modifiers::default();
        loop {
            match self.peek() {
                TokenKind::Public => modifiers.is_public = true,
                TokenKind::Private => modifiers.is_private = true,
                TokenKind::Static => modifiers.is_static = true,
                _ => return modifiers,
            }
            self.advance();
        }
    }

    fn parse_class(&mut self) -> ParseResult<ClassDecl> {
        let location = self.location();
        let modifiers = self.parse_modifiers();
        if modifiers.is_static {
            return Err(Diagnostic::error(
                codes::UNEXPECTED_TOKEN,
                "modifier `static` is not valid on a class",
            )
            .at(location));
        }
        self.expect(TokenKind::Class)?;
        let (name, _) = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;

        let mut class = ClassDecl {
            name,
            is_public: modifiers.is_public,
            fields: Vec::new(),
            methods: Vec::new(),
            location,
        };

        while !self.check(&TokenKind::RBrace) && !self.is_eof() {
            if let Err(err) = self.parse_member(&mut class) {
                self.errors.push(err);
                self.synchronize();
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(class)
    }

    fn parse_member(&mut self, class: &mut ClassDecl) -> ParseResult<()> {
        let location = self.location();
        let modifiers = self.parse_modifiers();
        if modifiers.is_public && modifiers.is_private {
            return Err(Diagnostic::error(
                codes::UNEXPECTED_TOKEN,
                "a member cannot be both `public` and `private`",
            )
            .at(location));
        }

        let ty = self.parse_type()?;
        let (name, name_location) = self.expect_ident()?;

        if self.check(&TokenKind::LParen) {
            let params = self.parse_params()?;
            let body = self.parse_body()?;
            class.methods.push(MethodDecl {
                name,
                is_public: modifiers.is_public,
                is_static: modifiers.is_static,
                return_ty: ty,
                params,
                body,
                location: name_location,
            });
            return Ok(());
        }

        if modifiers.is_static {
            return Err(Diagnostic::error(
                codes::UNEXPECTED_TOKEN,
                format!("static field `{}` is not supported", name),
            )
            .at(location));
        }
        let init = if self.matches(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        class.fields.push(FieldDecl {
            name,
            ty,
            init,
            is_public: modifiers.is_public,
            location: name_location,
        });
        Ok(())
    }

    fn parse_type(&mut self) -> ParseResult<TypeName> {
        let ty = match self.peek().clone() {
            TokenKind::IntType => TypeName::Int,
            TokenKind::BoolType => TypeName::Bool,
            TokenKind::VoidType => TypeName::Void,
            TokenKind::Ident(name) => TypeName::Named(name),
            _ => return Err(self.unexpected("a type")),
        };
        self.advance();
        Ok(ty)
    }

    fn parse_params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let ty = self.parse_type()?;
                let (name, location) = self.expect_ident()?;
                params.push(Param { name, ty, location });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_body(&mut self) -> ParseResult<Body> {
        let location = self.location();
        if self.matches(&TokenKind::Arrow) {
            self.require_version("expression-bodied members", location);
            let expr = self.parse_expr()?;
            self.expect(TokenKind::Semi)?;
            return Ok(Body::Expr(expr));
        }
        Ok(Body::Block(self.parse_block()?))
    }

    // ---- nesting ----

    /// Count one more level of nesting, failing past `MAX_NESTING`
    fn enter(&mut self) -> ParseResult<()> {
        if self.depth >= MAX_NESTING {
            return Err(Diagnostic::error(
                codes::NESTING_TOO_DEEP,
                format!("nesting exceeds the maximum depth of {}", MAX_NESTING),
            )
            .at(self.location()));
        }
        self.depth += 1;
        Ok(())
    }

    /// Run `f` and restore the nesting depth afterwards, on success or error
    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        let saved = self.depth;
        let result = f(self);
        self.depth = saved;
        result
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.scoped(|parser| {
            parser.enter()?;
            f(parser)
        })
    }

    // ---- statements ----

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_eof() {
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn starts_local(&self) -> bool {
        match self.peek() {
            TokenKind::IntType | TokenKind::BoolType | TokenKind::VoidType => true,
            TokenKind::Ident(_) => matches!(self.peek_at(1), TokenKind::Ident(_)),
            _ => false,
        }
    }

    fn parse_stmt(&mut self) -> ParseResult<Stmt> {
        let location = self.location();
        match self.peek() {
            TokenKind::LBrace => return Ok(Stmt::Block(self.nested(Self::parse_block)?)),
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semi)?;
                return Ok(Stmt::Return { value, location });
            }
            TokenKind::If => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let then_branch = Box::new(self.nested(Self::parse_stmt)?);
                let else_branch = if self.matches(&TokenKind::Else) {
                    Some(Box::new(self.nested(Self::parse_stmt)?))
                } else {
                    None
                };
                return Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                });
            }
            TokenKind::While => {
                self.advance();
                self.require_version("`while` loops", location);
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let body = Box::new(self.nested(Self::parse_stmt)?);
                return Ok(Stmt::While { cond, body });
            }
            _ => {}
        }

        if self.starts_local() {
            let ty = self.parse_type()?;
            let (name, location) = self.expect_ident()?;
            self.expect(TokenKind::Assign)?;
            let init = self.parse_expr()?;
            self.expect(TokenKind::Semi)?;
            return Ok(Stmt::Local {
                ty,
                name,
                init,
                location,
            });
        }

        let expr = self.parse_expr()?;
        if self.matches(&TokenKind::Assign) {
            let value = self.parse_expr()?;
            self.expect(TokenKind::Semi)?;
            return Ok(Stmt::Assign {
                target: expr,
                value,
                location,
            });
        }
        self.expect(TokenKind::Semi)?;
        Ok(Stmt::Expr(expr))
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_binary(0)
    }

    fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
        let op = match kind {
            TokenKind::OrOr => (BinaryOp::Or, 0),
            TokenKind::AndAnd => (BinaryOp::And, 1),
            TokenKind::EqEq => (BinaryOp::Eq, 2),
            TokenKind::NotEq => (BinaryOp::Ne, 2),
            TokenKind::Lt => (BinaryOp::Lt, 3),
            TokenKind::Le => (BinaryOp::Le, 3),
            TokenKind::Gt => (BinaryOp::Gt, 3),
            TokenKind::Ge => (BinaryOp::Ge, 3),
            TokenKind::Plus => (BinaryOp::Add, 4),
            TokenKind::Minus => (BinaryOp::Sub, 4),
            TokenKind::Star => (BinaryOp::Mul, 5),
            TokenKind::Slash => (BinaryOp::Div, 5),
            TokenKind::Percent => (BinaryOp::Rem, 5),
            _ => return None,
        };
        Some(op)
    }

    // Each operator in a chain nests the tree one level deeper.
    fn parse_binary(&mut self, min_precedence: u8) -> ParseResult<Expr> {
        self.scoped(|parser| {
            let mut left = parser.parse_unary()?;
            while let Some((op, precedence)) = Self::binary_op(parser.peek()) {
                if precedence < min_precedence {
                    break;
                }
                parser.enter()?;
                let location = parser.location();
                parser.advance();
                let right = parser.parse_binary(precedence + 1)?;
                left = Expr::new(
                    ExprKind::Binary(op, Box::new(left), Box::new(right)),
                    location,
                );
            }
            Ok(left)
        })
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let location = self.location();
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), location))
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        self.scoped(|parser| {
            let mut expr = parser.parse_primary()?;
            loop {
                let location = parser.location();
                if parser.matches(&TokenKind::Dot) {
                    parser.enter()?;
                    let (name, _) = parser.expect_ident()?;
                    expr = Expr::new(ExprKind::Member(Box::new(expr), name), location);
                } else if parser.check(&TokenKind::LParen) {
                    parser.enter()?;
                    let args = parser.parse_args()?;
                    expr = Expr::new(ExprKind::Call(Box::new(expr), args), location);
                } else {
                    return Ok(expr);
                }
            }
        })
    }

    fn parse_args(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.nested(Self::parse_expr)?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let location = self.location();
        let kind = match self.peek().clone() {
            TokenKind::Int(value) => ExprKind::Int(value),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::This => ExprKind::This,
            TokenKind::Ident(name) => ExprKind::Name(name),
            TokenKind::New => {
                self.advance();
                let (name, _) = self.expect_ident()?;
                let args = self.parse_args()?;
                if !args.is_empty() {
                    return Err(Diagnostic::error(
                        codes::ARGUMENT_COUNT,
                        format!("`{}` has no constructor taking {} argument(s)", name, args.len()),
                    )
                    .at(location));
                }
                return Ok(Expr::new(ExprKind::New(name), location));
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.nested(Self::parse_expr)?;
                self.expect(TokenKind::RParen)?;
                return Ok(expr);
            }
            _ => return Err(self.unexpected("an expression")),
        };
        self.advance();
        Ok(Expr::new(kind, location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_latest(source: &str) -> Result<CompilationUnit, Vec<Diagnostic>> {
        parse(source, LanguageVersion::V2)
    }

    #[test]
    fn test_parse_expression_bodied_class() {
        let unit = parse_latest("public class C { public int F() => 2+2; }").unwrap();
        assert_eq!(unit.classes.len(), 1);

        let class = &unit.classes[0];
        assert_eq!(class.name, "C");
        assert!(class.is_public);
        let method = &class.methods[0];
        assert_eq!(method.name, "F");
        assert_eq!(method.return_ty, TypeName::Int);
        assert!(matches!(
            method.body,
            Body::Expr(Expr {
                kind: ExprKind::Binary(BinaryOp::Add, _, _),
                ..
            })
        ));
    }

    #[test]
    fn test_precedence() {
        let unit = parse_latest("class A { static int F() => 1 + 2 * 3 == 7 && true; }").unwrap();
        let Body::Expr(expr) = &unit.classes[0].methods[0].body else {
            panic!("expected expression body");
        };
        let ExprKind::Binary(BinaryOp::And, left, _) = &expr.kind else {
            panic!("expected && at the root, got {:?}", expr.kind);
        };
        let ExprKind::Binary(BinaryOp::Eq, sum, _) = &left.kind else {
            panic!("expected == under &&");
        };
        assert!(matches!(sum.kind, ExprKind::Binary(BinaryOp::Add, _, _)));
    }

    #[test]
    fn test_statements_and_fields() {
        let source = r#"
            public class Counter {
                private int count = 0;
                public void Add(int n) { count = count + n; }
                public int Get() {
                    int total = count;
                    if (total < 0) { return 0; } else return total;
                }
            }
        "#;
        let unit = parse_latest(source).unwrap();
        let class = &unit.classes[0];
        assert_eq!(class.fields.len(), 1);
        assert!(!class.fields[0].is_public);
        assert_eq!(class.methods.len(), 2);

        let Body::Block(stmts) = &class.methods[1].body else {
            panic!("expected block body");
        };
        assert!(matches!(stmts[0], Stmt::Local { .. }));
        assert!(stmts[1].always_returns());
    }

    #[test]
    fn test_empty_source() {
        let errors = parse_latest("").unwrap_err();
        assert_eq!(errors[0].code, codes::EMPTY_SOURCE);

        let errors = parse_latest("  // only a comment\n").unwrap_err();
        assert_eq!(errors[0].code, codes::EMPTY_SOURCE);
    }

    #[test]
    fn test_recovers_after_syntax_error() {
        let source = "class A { int F() { return 1 } int G() { return ; ; } } class B { int x = ; }";
        let errors = parse_latest(source).unwrap_err();
        assert!(errors.len() >= 2);
        assert!(errors.iter().all(|e| e.code == codes::UNEXPECTED_TOKEN));
    }

    #[test]
    fn test_language_version_gating() {
        let errors = parse("class A { int F() => 1; }", LanguageVersion::V1).unwrap_err();
        assert_eq!(errors[0].code, codes::FEATURE_UNAVAILABLE);

        let errors = parse(
            "class A { void F() { while (true) { } } }",
            LanguageVersion::V1,
        )
        .unwrap_err();
        assert_eq!(errors[0].code, codes::FEATURE_UNAVAILABLE);

        assert!(parse("class A { int F() { return 1; } }", LanguageVersion::V1).is_ok());
    }

    #[test]
    fn test_static_field_rejected() {
        let errors = parse_latest("class A { static int x; }").unwrap_err();
        assert!(errors[0].message.contains("static field"));
    }

    fn parenthesised(depth: usize) -> String {
        format!(
            "class C {{ int F() => {}1{}; }}",
            "(".repeat(depth),
            ")".repeat(depth)
        )
    }

    #[test]
    fn test_nesting_within_limit() {
        assert!(parse_latest(&parenthesised(MAX_NESTING / 2)).is_ok());

        let negations = format!("class C {{ int F() => {}1; }}", "-".repeat(MAX_NESTING / 2));
        assert!(parse_latest(&negations).is_ok());
    }

    #[test]
    fn test_deep_parentheses_rejected() {
        let errors = parse_latest(&parenthesised(10_000)).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);
    }

    #[test]
    fn test_deep_blocks_rejected() {
        let depth = 10_000;
        let source = format!(
            "class C {{ void F() {}{} }}",
            "{".repeat(depth),
            "}".repeat(depth)
        );
        let errors = parse_latest(&source).unwrap_err();
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);

        let branches = format!(
            "class C {{ void F() {{ {} return; }} }}",
            "if (true) ".repeat(depth)
        );
        let errors = parse_latest(&branches).unwrap_err();
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);
    }

    #[test]
    fn test_long_chains_rejected() {
        let sum = format!("class C {{ int F() => 1{}; }}", " + 1".repeat(10_000));
        let errors = parse_latest(&sum).unwrap_err();
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);

        let negations = format!("class C {{ int F() => {}1; }}", "!".repeat(10_000));
        let errors = parse_latest(&negations).unwrap_err();
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);

        let calls = format!("class C {{ int F() => F{}; }}", "()".repeat(10_000));
        let errors = parse_latest(&calls).unwrap_err();
        assert_eq!(errors[0].code, codes::NESTING_TOO_DEEP);
    }
}
