use crate::diagnostics::{codes, Diagnostic, Location};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),

    Class,
    Public,
    Private,
    Static,
    Return,
    If,
    Else,
    While,
    New,
    This,
    True,
    False,
    IntType,
    BoolType,
    VoidType,

    LBrace,
    RBrace,
    LParen,
    RParen,
    Semi,
    Comma,
    Dot,
    Assign,
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier `{}`", name),
            Self::Int(value) => format!("integer `{}`", value),
            Self::Eof => "end of file".to_string(),
            other => format!("`{}`", other.text()),
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Public => "public",
            Self::Private => "private",
            Self::Static => "static",
            Self::Return => "return",
            Self::If => "if",
            Self::Else => "else",
            Self::While => "while",
            Self::New => "new",
            Self::This => "this",
            Self::True => "true",
            Self::False => "false",
            Self::IntType => "int",
            Self::BoolType => "bool",
            Self::VoidType => "void",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Semi => ";",
            Self::Comma => ",",
            Self::Dot => ".",
            Self::Assign => "=",
            Self::Arrow => "=>",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Bang => "!",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::AndAnd => "&&",
            Self::OrOr => "||",
            Self::Ident(_) | Self::Int(_) | Self::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: Location,
}

pub fn lex(source: &str) -> Result<Vec<Token>, Vec<Diagnostic>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    errors: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Vec<Diagnostic>> {
        while let Some(&ch) = self.chars.peek() {
            let start = self.location();
            match ch {
                ch if ch.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek_second() == Some('/') => self.eat_line_comment(),
                '/' if self.peek_second() == Some('*') => self.eat_block_comment(start),
                ch if ch.is_ascii_alphabetic() || ch == '_' => self.lex_identifier(start),
                ch if ch.is_ascii_digit() => self.lex_number(start),
                _ => self.lex_symbol(start),
            }
        }
        let end = self.location();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            location: end,
        });

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    fn location(&self) -> Location {
        Location::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn eat_line_comment(&mut self) {
        while let Some(ch) = self.bump() {
            if ch == '\n' {
                break;
            }
        }
    }

    fn eat_block_comment(&mut self, start: Location) {
        self.bump();
        self.bump();
        let mut previous = '\0';
        while let Some(ch) = self.bump() {
            if previous == '*' && ch == '/' {
                return;
            }
            previous = ch;
        }
        self.errors.push(
            Diagnostic::error(codes::UNEXPECTED_TOKEN, "unterminated block comment").at(start),
        );
    }

    fn lex_identifier(&mut self, start: Location) {
        let mut text = String::new();
        while let Some(&ch) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }

        let kind = match text.as_str() {
            "class" => TokenKind::Class,
            "public" => TokenKind::Public,
            "private" => TokenKind::Private,
            "static" => TokenKind::Static,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "new" => TokenKind::New,
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "int" => TokenKind::IntType,
            "bool" => TokenKind::BoolType,
            "void" => TokenKind::VoidType,
            _ => TokenKind::Ident(text),
        };
        self.tokens.push(Token {
            kind,
            location: start,
        });
    }

    fn lex_number(&mut self, start: Location) {
        let mut text = String::new();
        while let Some(&ch) = self.chars.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }

        match text.parse::<i64>() {
            Ok(value) => self.tokens.push(Token {
                kind: TokenKind::Int(value),
                location: start,
            }),
            Err(_) => self.errors.push(
                Diagnostic::error(
                    codes::INTEGER_OVERFLOW,
                    format!("integer literal `{}` is too large", text),
                )
                .at(start),
            ),
        }
    }

    fn lex_symbol(&mut self, start: Location) {
        let Some(ch) = self.bump() else {
            return;
        };
        let next = self.chars.peek().copied();

        let (kind, wide) = match (ch, next) {
            ('=', Some('=')) => (TokenKind::EqEq, true),
            ('=', Some('>')) => (TokenKind::Arrow, true),
            ('!', Some('=')) => (TokenKind::NotEq, true),
            ('<', Some('=')) => (TokenKind::Le, true),
            ('>', Some('=')) => (TokenKind::Ge, true),
            ('&', Some('&')) => (TokenKind::AndAnd, true),
            ('|', Some('|')) => (TokenKind::OrOr, true),
            ('=', _) => (TokenKind::Assign, false),
            ('!', _) => (TokenKind::Bang, false),
            ('<', _) => (TokenKind::Lt, false),
            ('>', _) => (TokenKind::Gt, false),
            ('{', _) => (TokenKind::LBrace, false),
            ('}', _) => (TokenKind::RBrace, false),
            ('(', _) => (TokenKind::LParen, false),
            (')', _) => (TokenKind::RParen, false),
            (';', _) => (TokenKind::Semi, false),
            (',', _) => (TokenKind::Comma, false),
            ('.', _) => (TokenKind::Dot, false),
            ('+', _) => (TokenKind::Plus, false),
            ('-', _) => (TokenKind::Minus, false),
            ('*', _) => (TokenKind::Star, false),
            ('/', _) => (TokenKind::Slash, false),
            ('%', _) => (TokenKind::Percent, false),
            _ => {
                self.errors.push(
                    Diagnostic::error(
                        codes::INVALID_CHARACTER,
                        format!("unexpected character `{}`", ch),
                    )
                    .at(start),
                );
                return;
            }
        };

        if wide {
            self.bump();
        }
        self.tokens.push(Token {
            kind,
            location: start,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_lex_expression_bodied_method() {
        assert_eq!(
            kinds("public int F() => 2+2;"),
            vec![
                TokenKind::Public,
                TokenKind::IntType,
                TokenKind::Ident("F".to_string()),
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Int(2),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_locations() {
        let tokens = lex("// header\nclass /* inline */ A").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Class);
        assert_eq!(tokens[0].location, Location::new(2, 1));
        assert_eq!(tokens[1].kind, TokenKind::Ident("A".to_string()));
        assert_eq!(tokens[1].location, Location::new(2, 20));
    }

    #[test]
    fn test_invalid_character() {
        let errors = lex("int x = 1 # 2;").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, codes::INVALID_CHARACTER);
        assert_eq!(errors[0].location, Some(Location::new(1, 11)));
    }

    #[test]
    fn test_unterminated_comment() {
        let errors = lex("class A { /* never closed").unwrap_err();
        assert_eq!(errors[0].code, codes::UNEXPECTED_TOKEN);
    }
}
