//! Recursive descent parser for the native expression language.

use crate::expr::{BinaryOp, Builtin, Expr, ParseError, UnaryOp};
use serde_json::{Number, Value};

/// Deepest expression tree the parser builds. Evaluation recurses over the
/// tree, so this also bounds evaluation depth.
pub(crate) const MAX_DEPTH: usize = 128;

pub(crate) struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0, depth: 0 }
    }

    /// Parses a whole expression, rejecting trailing input.
    pub(crate) fn parse_complete(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        if self.at_end() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_expr()?;
        self.expect_end()?;
        Ok(expr)
    }

    /// Parses `name := expr`.
    pub(crate) fn parse_assignment(&mut self) -> Result<(String, Expr), ParseError> {
        self.skip_whitespace();
        let name = self
            .parse_identifier()
            .ok_or_else(|| self.error("expected variable name"))?;
        self.skip_whitespace();
        if !self.peek_str(":=") {
            return Err(self.error("expected ':='"));
        }
        self.pos += 2;
        self.skip_whitespace();
        if self.at_end() {
            return Err(self.error("missing value after ':='"));
        }
        let expr = self.parse_expr()?;
        self.expect_end()?;
        Ok((name, expr))
    }

    fn error(&self, reason: impl Into<String>) -> ParseError {
        ParseError {
            source_text: self.input.trim().to_string(),
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        self.skip_whitespace();
        if !self.at_end() {
            return Err(self.error(format!(
                "unexpected input '{}'",
                &self.input[self.pos..]
            )));
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("expression nested deeper than {} levels", MAX_DEPTH)));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.descend()?;
        let expr = self.parse_or()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        let mut levels = 0;
        while self.peek_str("||") {
            self.pos += 2;
            self.descend()?;
            levels += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        self.depth -= levels;

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        let mut levels = 0;
        while self.peek_str("&&") {
            self.pos += 2;
            self.descend()?;
            levels += 1;
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        self.depth -= levels;

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        let mut levels = 0;
        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinaryOp::Eq
            } else if self.peek_str("!=") {
                BinaryOp::Ne
            } else {
                self.depth -= levels;
                return Ok(left);
            };
            self.pos += 2;
            self.descend()?;
            levels += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let (op, width) = if self.peek_str("<=") {
            (BinaryOp::Le, 2)
        } else if self.peek_str(">=") {
            (BinaryOp::Ge, 2)
        } else if self.peek_char() == Some('<') {
            (BinaryOp::Lt, 1)
        } else if self.peek_char() == Some('>') {
            (BinaryOp::Gt, 1)
        } else {
            return Ok(left);
        };
        self.pos += width;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        let mut levels = 0;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => {
                    self.depth -= levels;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            levels += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        let mut levels = 0;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => {
                    self.depth -= levels;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            levels += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();

        let op = match self.peek_char() {
            Some('!') => UnaryOp::Not,
            Some('-') => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        self.descend()?;
        let inner = self.parse_unary()?; // Recursive to allow !!a and --a
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        let mut levels = 0;
        loop {
            // No whitespace skipping: `a .b` is not member access.
            match self.peek_char() {
                Some('.') => {
                    self.pos += 1;
                    self.descend()?;
                    levels += 1;
                    let field = self
                        .parse_identifier()
                        .ok_or_else(|| self.error("expected field name after '.'"))?;
                    expr = Expr::Member(Box::new(expr), field);
                }
                Some('[') => {
                    self.pos += 1;
                    self.descend()?;
                    levels += 1;
                    let index = self.parse_expr()?;
                    self.expect_char(']')?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => {
                    self.depth -= levels;
                    return Ok(expr);
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect_char(')')?;
                Ok(expr)
            }
            Some('[') => {
                self.pos += 1;
                let items = self.parse_list(']')?;
                Ok(Expr::List(items))
            }
            Some('"') | Some('\'') => self.parse_string().map(|s| Expr::Literal(Value::String(s))),
            Some('$') => {
                self.pos += 1;
                Ok(Expr::Payload)
            }
            Some(c) if c.is_ascii_digit() => self.parse_number().map(Expr::Literal),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                let name = self
                    .parse_identifier()
                    .ok_or_else(|| self.error("expected identifier"))?;
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    _ => {}
                }

                self.skip_whitespace_inline();
                if self.peek_char() != Some('(') {
                    return Ok(Expr::Var(name));
                }
                let builtin = Builtin::from_name(&name).ok_or_else(|| {
                    self.pos = start;
                    self.error(format!("unknown function '{}'", name))
                })?;
                self.pos += 1;
                let args = self.parse_list(')')?;
                if args.len() != builtin.arity() {
                    return Err(self.error(format!(
                        "{}() takes {} argument(s), got {}",
                        name,
                        builtin.arity(),
                        args.len()
                    )));
                }
                Ok(Expr::Call(builtin, args))
            }
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    /// Parses comma separated expressions up to and including `close`.
    fn parse_list(&mut self, close: char) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error(format!("expected ',' or '{}'", close))),
            }
        }
    }

    fn parse_identifier(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if c.is_alphabetic() || c == '_' => {}
            _ => return None,
        }
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Some(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .peek_char()
                .ok_or_else(|| self.error("unterminated string"))?;
            self.pos += escaped.len_utf8();
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
        }

        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        self.skip_digits();

        // A '.' followed by a digit continues the number, anything else is member access.
        let is_float = self.peek_char() == Some('.')
            && self.input[self.pos + 1..]
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false);
        if is_float {
            self.pos += 1;
            self.skip_digits();
        }

        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.error(format!("invalid number: '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Value::from)
                .map_err(|_| self.error(format!("invalid number: '{}'", text)))
        }
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.peek_char() != Some(expected) {
            return Err(self.error(format!("expected '{}'", expected)));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn skip_whitespace_inline(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == ' ' || c == '\t' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Expr, ParseError> {
        Parser::new(s).parse_complete()
    }

    #[test]
    fn test_parse_member_chain() {
        let expr = parse("order.customer.verified").unwrap();
        assert_eq!(
            expr,
            Expr::Member(
                Box::new(Expr::Member(
                    Box::new(Expr::Var("order".to_string())),
                    "customer".to_string()
                )),
                "verified".to_string()
            )
        );
    }

    #[test]
    fn test_parse_negative_number() {
        let expr = parse("temp > -10").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Gt, _, ref r) if matches!(**r, Expr::Unary(UnaryOp::Neg, _))));
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse("0.5").unwrap(), Expr::Literal(serde_json::json!(0.5)));
        assert_eq!(parse("12").unwrap(), Expr::Literal(serde_json::json!(12)));
    }

    #[test]
    fn test_parse_not_equal_vs_not() {
        assert!(matches!(parse("!a != b").unwrap(), Expr::Binary(BinaryOp::Ne, _, _)));
    }

    #[test]
    fn test_parse_empty_expression() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn test_parse_unclosed_parenthesis() {
        assert!(parse("!(a && b").is_err());
        assert!(parse("(a && b").is_err());
        assert!(parse("[1, 2").is_err());
    }

    #[test]
    fn test_parse_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = parse(&deep).unwrap_err();
        assert!(err.reason.contains("nested deeper"), "{}", err.reason);

        assert!(parse(&format!("{}true", "!".repeat(100_000))).is_err());
        assert!(parse(&format!("x{}", ".a".repeat(100_000))).is_err());
        assert!(parse(&vec!["1"; 100_000].join(" + ")).is_err());

        let shallow = format!("{}1{}", "(".repeat(MAX_DEPTH / 2), ")".repeat(MAX_DEPTH / 2));
        assert!(parse(&shallow).is_ok());
        assert!(parse(&vec!["1"; MAX_DEPTH / 2].join(" + ")).is_ok());
    }

    #[test]
    fn test_parse_unterminated_string() {
        assert!(parse("name == \"unclosed").is_err());
        assert!(parse("'abc\\").is_err());
    }

    #[test]
    fn test_parse_trailing_input() {
        let err = parse("a b").unwrap_err();
        assert!(err.reason.contains("unexpected input"));
    }

    #[test]
    fn test_parse_unknown_function() {
        let err = parse("sqrt(4)").unwrap_err();
        assert!(err.reason.contains("unknown function"));
    }

    #[test]
    fn test_parse_builtin_arity() {
        assert!(parse("len(a, b)").is_err());
        assert!(parse("max(a)").is_err());
        assert!(parse("max(a, 1)").is_ok());
    }

    #[test]
    fn test_parse_integer_overflow() {
        assert!(parse("99999999999999999999").is_err());
    }

    #[test]
    fn test_parse_assignment() {
        let (name, expr) = Parser::new("count := count + 1").parse_assignment().unwrap();
        assert_eq!(name, "count");
        assert!(matches!(expr, Expr::Binary(BinaryOp::Add, _, _)));

        assert!(Parser::new("count = 1").parse_assignment().is_err());
        assert!(Parser::new("count :=").parse_assignment().is_err());
        assert!(Parser::new(":= 1").parse_assignment().is_err());
    }

    #[test]
    fn test_parse_payload_index() {
        let expr = parse("$[0].id").unwrap();
        assert!(matches!(expr, Expr::Member(ref base, _) if matches!(**base, Expr::Index(..))));
    }
}
