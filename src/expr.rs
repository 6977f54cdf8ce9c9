// Rule-expression evaluator.
//
// Small infix expressions over the dynamic value domain:
//
//   expr ::= literal | ident | ident '(' args ')' | '(' expr ')'
//          | '!' expr | expr OP expr
//
// Literals are decimal numbers, true/false, and single- or
// double-quoted strings. Identifiers resolve through a variable
// registry, calls through a function registry; anything unknown
// resolves to Null. Malformed input evaluates to Null -- the
// evaluator never panics on caller text. Callers that need a
// diagnostic must pre-validate.
//
// && and || short-circuit at the tree level: the right operand of
// a decided conjunction is never evaluated, so its function calls
// never run.

use std::collections::HashMap;

use crate::value::{BinOp, UnOp, Value};


#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Op(BinOp),
    Bang,
    LParen,
    RParen,
    Comma,
    End,
}


struct Lexer<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Lexer<'a> {
        Lexer { input: input.as_bytes(), position: 0 }
    }

    fn peek_byte(&self) -> u8 {
        *self.input.get(self.position).unwrap_or(&0)
    }

    fn byte_at(&self, offset: usize) -> u8 {
        *self.input.get(self.position + offset).unwrap_or(&0)
    }

    // None means a lex error; the caller turns that into Null.
    fn next_token(&mut self) -> Option<Token> {
        while self.peek_byte().is_ascii_whitespace() {
            self.position += 1;
        }

        let c = self.peek_byte();
        if c == 0 {
            return Some(Token::End);
        }

        if c.is_ascii_digit() || (c == b'.' && self.byte_at(1).is_ascii_digit()) {
            return self.lex_number();
        }

        if c == b'"' || c == b'\'' {
            return self.lex_string(c);
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.lex_ident();
        }

        // Two-character operators first.
        let two = [c, self.byte_at(1)];
        let double = match &two {
            b"==" => Some(Token::Op(BinOp::Eq)),
            b"!=" => Some(Token::Op(BinOp::Neq)),
            b">=" => Some(Token::Op(BinOp::Gte)),
            b"<=" => Some(Token::Op(BinOp::Lte)),
            b"&&" => Some(Token::Op(BinOp::And)),
            b"||" => Some(Token::Op(BinOp::Or)),
            _ => None,
        };
        if double.is_some() {
            self.position += 2;
            return double;
        }

        self.position += 1;
        match c {
            b'+' => Some(Token::Op(BinOp::Add)),
            b'-' => Some(Token::Op(BinOp::Sub)),
            b'*' => Some(Token::Op(BinOp::Mul)),
            b'/' => Some(Token::Op(BinOp::Div)),
            b'%' => Some(Token::Op(BinOp::Mod)),
            b'>' => Some(Token::Op(BinOp::Gt)),
            b'<' => Some(Token::Op(BinOp::Lt)),
            b'!' => Some(Token::Bang),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b',' => Some(Token::Comma),
            _ => None,
        }
    }

    fn lex_number(&mut self) -> Option<Token> {
        let start = self.position;
        while self.peek_byte().is_ascii_digit() || self.peek_byte() == b'.' {
            self.position += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.position]).ok()?;
        text.parse::<f64>().ok().map(Token::Number)
    }

    fn lex_string(&mut self, quote: u8) -> Option<Token> {
        self.position += 1;
        let start = self.position;
        while self.peek_byte() != quote {
            if self.peek_byte() == 0 {
                // Unterminated string.
                return None;
            }
            self.position += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.position]).ok()?;
        self.position += 1;
        Some(Token::Str(String::from(text)))
    }

    fn lex_ident(&mut self) -> Option<Token> {
        let start = self.position;
        while self.peek_byte().is_ascii_alphanumeric()
            || self.peek_byte() == b'_' {
            self.position += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.position]).ok()?;
        Some(match text {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            _ => Token::Ident(String::from(text)),
        })
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}


// Binding strength, tightest first:
//   !   then  * / %   then  + -   then relational   then == !=
//   then &&  then ||
fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
        BinOp::Add | BinOp::Sub => 4,
        BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => 3,
        BinOp::Eq | BinOp::Neq => 2,
        BinOp::And => 1,
        BinOp::Or => 0,
    }
}


struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Option<Parser<'a>> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Some(Parser { lexer, current })
    }

    fn advance(&mut self) -> Option<()> {
        self.current = self.lexer.next_token()?;
        Some(())
    }

    // Precedence climbing; all binary operators associate left.
    fn parse_expr(&mut self, min_prec: u8) -> Option<Expr> {
        let mut lhs = self.parse_factor()?;

        while let Token::Op(op) = self.current {
            if precedence(op) < min_prec {
                break;
            }
            self.advance()?;
            let rhs = self.parse_expr(precedence(op) + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Some(lhs)
    }

    fn parse_factor(&mut self) -> Option<Expr> {
        match self.current.clone() {
            Token::Number(n) => {
                self.advance()?;
                Some(Expr::Literal(Value::Float(n as f32)))
            },
            Token::Str(s) => {
                self.advance()?;
                Some(Expr::Literal(Value::Str(s)))
            },
            Token::Bool(b) => {
                self.advance()?;
                Some(Expr::Literal(Value::Bool(b)))
            },
            Token::Bang => {
                self.advance()?;
                let operand = self.parse_factor()?;
                Some(Expr::Unary(UnOp::Not, Box::new(operand)))
            },
            Token::Ident(name) => {
                self.advance()?;
                if self.current == Token::LParen {
                    self.parse_call(name)
                } else {
                    Some(Expr::Ident(name))
                }
            },
            Token::LParen => {
                self.advance()?;
                let inner = self.parse_expr(0)?;
                if self.current != Token::RParen {
                    return None;
                }
                self.advance()?;
                Some(inner)
            },
            _ => None,
        }
    }

    fn parse_call(&mut self, name: String) -> Option<Expr> {
        self.advance()?;   // consume '('
        let mut args = Vec::new();

        if self.current != Token::RParen {
            loop {
                args.push(self.parse_expr(0)?);
                match self.current {
                    Token::Comma => { self.advance()?; },
                    Token::RParen => break,
                    _ => return None,
                }
            }
        }

        self.advance()?;   // consume ')'
        Some(Expr::Call(name, args))
    }
}


pub fn parse(input: &str) -> Option<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_expr(0)?;
    if parser.current != Token::End {
        // Trailing garbage is a parse failure, not a prefix parse.
        return None;
    }
    Some(expr)
}


pub type RuleFn = Box<dyn Fn(&[Value]) -> Value>;


pub struct RuleInterpreter {
    variables: HashMap<String, Value>,
    functions: HashMap<String, RuleFn>,
}

impl RuleInterpreter {
    pub fn new() -> RuleInterpreter {
        RuleInterpreter {
            variables: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    // Copies the value in; later registrations replace earlier
    // ones.
    pub fn register_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(String::from(name), value);
    }

    pub fn register_function(&mut self, name: &str, handler: RuleFn) {
        self.functions.insert(String::from(name), handler);
    }

    pub fn evaluate(&self, input: &str) -> Value {
        match parse(input) {
            Some(expr) => self.eval(&expr),
            None => Value::Null,
        }
    }

    pub fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(v) => v.clone(),

            Expr::Ident(name) => self.variables
                .get(name)
                .cloned()
                .unwrap_or(Value::Null),

            Expr::Call(name, args) => match self.functions.get(name) {
                Some(f) => {
                    let values: Vec<Value> =
                        args.iter().map(|a| self.eval(a)).collect();
                    f(&values)
                },
                None => Value::Null,
            },

            Expr::Unary(op, operand) => {
                let v = self.eval(operand);
                Value::apply_unary(*op, &v).unwrap_or(Value::Null)
            },

            // Short-circuit: the right side is not evaluated when
            // the left side decides the result.
            Expr::Binary(BinOp::And, lhs, rhs) => match self.eval(lhs) {
                Value::Bool(false) => Value::Bool(false),
                Value::Bool(true) => match self.eval(rhs) {
                    Value::Bool(b) => Value::Bool(b),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },

            Expr::Binary(BinOp::Or, lhs, rhs) => match self.eval(lhs) {
                Value::Bool(true) => Value::Bool(true),
                Value::Bool(false) => match self.eval(rhs) {
                    Value::Bool(b) => Value::Bool(b),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },

            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs);
                let b = self.eval(rhs);
                Value::apply_binary(*op, &a, &b).unwrap_or(Value::Null)
            },
        }
    }
}
