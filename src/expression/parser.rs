//! Recursive-descent parser producing the restricted AST.
//!
//! Safety checks happen here so that `validate_expression` and evaluation
//! reject exactly the same inputs: unknown bindings, unlisted functions,
//! prototype-style member names, and assignment.

use serde_json::Value;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::functions;
use super::lexer::{tokenize, SpannedToken, Token};
use super::{ExpressionError, BINDINGS, FORBIDDEN_MEMBERS};

const MAX_DEPTH: usize = 64;

/// Parse a single expression (the text between `{{` and `}}`).
pub fn parse_expression(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    if parser.peek() == &Token::Eof {
        return Err(ExpressionError::Syntax {
            position: 0,
            message: "empty expression".to_string(),
        });
    }
    let expr = parser.parse_conditional()?;
    parser.expect(Token::Eof)?;
    Ok(expr)
}

pub(crate) fn check_member(name: &str) -> Result<(), ExpressionError> {
    if FORBIDDEN_MEMBERS.contains(&name) {
        return Err(ExpressionError::Forbidden(format!(
            "access to '{}' is not allowed",
            name
        )));
    }
    Ok(())
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span.start
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExpressionError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", token)))
        }
    }

    fn unexpected(&self, context: &str) -> ExpressionError {
        if self.peek() == &Token::Assign {
            return ExpressionError::Forbidden("assignment is not allowed".to_string());
        }
        ExpressionError::Syntax {
            position: self.position(),
            message: format!("{}, found '{}'", context, self.peek()),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::Syntax {
                position: self.position(),
                message: "expression nested too deeply".to_string(),
            });
        }
        Ok(())
    }

    fn parse_conditional(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let test = self.parse_binary(0)?;
        let expr = if self.eat(&Token::Question) {
            let consequent = self.parse_conditional()?;
            self.expect(Token::Colon)?;
            let alternate = self.parse_conditional()?;
            Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            }
        } else {
            test
        };
        self.depth -= 1;
        Ok(expr)
    }

    /// Precedence climbing over the binary operator table.
    fn parse_binary(&mut self, min_level: u8) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while let Some((op, level)) = binary_op(self.peek()) {
            if level < min_level {
                break;
            }
            self.advance();
            let right = self.parse_binary(level + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Plus,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot | Token::OptionalDot => {
                    let optional = self.advance() == Token::OptionalDot;
                    if optional && self.peek() == &Token::LBracket {
                        expr = self.parse_index(expr, true)?;
                        continue;
                    }
                    let start = self.pos;
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        // `item.true` style keys are plain member names here
                        Token::True => "true".to_string(),
                        Token::False => "false".to_string(),
                        Token::Null => "null".to_string(),
                        _ => {
                            self.pos = start;
                            return Err(self.unexpected("expected property name"));
                        }
                    };
                    check_member(&name)?;
                    if self.peek() == &Token::LParen {
                        if !functions::is_method(&name) {
                            return Err(ExpressionError::UnknownFunction(name));
                        }
                        let args = self.parse_args()?;
                        expr = Expr::MethodCall {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                            optional,
                        };
                    } else {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property: name,
                            optional,
                        };
                    }
                }
                Token::LBracket => expr = self.parse_index(expr, false)?,
                Token::LParen => {
                    return Err(ExpressionError::Forbidden(
                        "only built-in functions can be called".to_string(),
                    ))
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_index(&mut self, object: Expr, optional: bool) -> Result<Expr, ExpressionError> {
        self.expect(Token::LBracket)?;
        self.enter()?;
        let index = self.parse_conditional()?;
        self.depth -= 1;
        self.expect(Token::RBracket)?;
        if let Expr::Literal(Value::String(key)) = &index {
            check_member(key)?;
        }
        Ok(Expr::Index {
            object: Box::new(object),
            index: Box::new(index),
            optional,
        })
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_conditional()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let start = self.pos;
        match self.advance() {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.enter()?;
                let expr = self.parse_conditional()?;
                self.depth -= 1;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => self.parse_array(),
            Token::LBrace => self.parse_object(),
            Token::Ident(name) => self.parse_identifier(name),
            _ => {
                self.pos = start;
                Err(self.unexpected("expected a value"))
            }
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr, ExpressionError> {
        if name.starts_with('$') {
            if !BINDINGS.contains(&name.as_str()) {
                return Err(ExpressionError::UnknownIdentifier(name));
            }
            return Ok(Expr::Binding(name));
        }
        if self.peek() == &Token::LParen {
            if !functions::is_function(&name) {
                return Err(ExpressionError::UnknownFunction(name));
            }
            let args = self.parse_args()?;
            return Ok(Expr::Call {
                function: name,
                args,
            });
        }
        if name == "undefined" {
            return Ok(Expr::Literal(Value::Null));
        }
        Err(ExpressionError::UnknownIdentifier(name))
    }

    fn parse_array(&mut self) -> Result<Expr, ExpressionError> {
        let mut elements = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(Expr::Array(elements));
        }
        self.enter()?;
        loop {
            elements.push(self.parse_conditional()?);
            if self.eat(&Token::RBracket) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        self.depth -= 1;
        Ok(Expr::Array(elements))
    }

    fn parse_object(&mut self) -> Result<Expr, ExpressionError> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Object(entries));
        }
        self.enter()?;
        loop {
            let start = self.pos;
            let key = match self.advance() {
                Token::Ident(name) if !name.starts_with('$') => name,
                Token::Str(s) => s,
                _ => {
                    self.pos = start;
                    return Err(self.unexpected("expected object key"));
                }
            };
            check_member(&key)?;
            self.expect(Token::Colon)?;
            entries.push((key, self.parse_conditional()?));
            if self.eat(&Token::RBrace) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        self.depth -= 1;
        Ok(Expr::Object(entries))
    }
}

fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
    let entry = match token {
        Token::Coalesce => (BinaryOp::Coalesce, 1),
        Token::OrOr => (BinaryOp::Or, 2),
        Token::AndAnd => (BinaryOp::And, 3),
        Token::EqEq => (BinaryOp::Eq, 4),
        Token::NotEq => (BinaryOp::NotEq, 4),
        Token::EqEqEq => (BinaryOp::StrictEq, 4),
        Token::NotEqEq => (BinaryOp::StrictNotEq, 4),
        Token::Lt => (BinaryOp::Lt, 5),
        Token::Le => (BinaryOp::Le, 5),
        Token::Gt => (BinaryOp::Gt, 5),
        Token::Ge => (BinaryOp::Ge, 5),
        Token::Plus => (BinaryOp::Add, 6),
        Token::Minus => (BinaryOp::Sub, 6),
        Token::Star => (BinaryOp::Mul, 7),
        Token::Slash => (BinaryOp::Div, 7),
        Token::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. })),
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_left_associative_subtraction() {
        let expr = parse_expression("10 - 4 - 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Sub,
                left,
                right,
            } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Sub, .. }));
                assert_eq!(*right, Expr::Literal(json!(3)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_node_lookup_and_method_call() {
        let expr = parse_expression(r#"$node["Fetch"].json.name.toUpperCase()"#).unwrap();
        assert!(matches!(expr, Expr::MethodCall { ref method, .. } if method == "toUpperCase"));
    }

    #[test]
    fn test_ternary_and_object_literal() {
        let expr = parse_expression("$json.ok ? {status: 'up'} : [1, 2]").unwrap();
        assert!(matches!(expr, Expr::Conditional { .. }));
    }

    #[test]
    fn test_rejects_prototype_access() {
        for source in [
            "$json.constructor",
            "$json['__proto__']",
            "$json.prototype.x",
            "{constructor: 1}",
        ] {
            assert!(
                matches!(parse_expression(source), Err(ExpressionError::Forbidden(_))),
                "{} should be rejected",
                source
            );
        }
    }

    #[test]
    fn test_rejects_unknown_identifiers_and_functions() {
        assert!(matches!(
            parse_expression("process.exit()"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            parse_expression("$process"),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            parse_expression("eval('1')"),
            Err(ExpressionError::UnknownFunction(_))
        ));
        assert!(matches!(
            parse_expression("$json.name.call()"),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_rejects_assignment_and_computed_calls() {
        assert!(matches!(
            parse_expression("$json.a = 1"),
            Err(ExpressionError::Forbidden(_))
        ));
        assert!(matches!(
            parse_expression("($json.f)(1)"),
            Err(ExpressionError::Forbidden(_))
        ));
    }

    #[test]
    fn test_syntax_errors_report_position() {
        match parse_expression("1 +") {
            Err(ExpressionError::Syntax { position, .. }) => assert_eq!(position, 3),
            other => panic!("expected syntax error, got {:?}", other),
        }
        assert!(parse_expression("").is_err());
        assert!(parse_expression("(1").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(
            parse_expression(&deep),
            Err(ExpressionError::Syntax { .. })
        ));
    }
}
