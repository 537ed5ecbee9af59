//! Default condition language for edges and condition nodes.
//!
//! A small boolean expression language over the execution's variables and
//! results:
//!
//! - literals: `"text"`, `'text'`, numbers, `true`, `false`, `null`
//! - dotted paths: `status`, `user.name`, `results.fetch.count`, `variables.x`
//! - comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`, `contains`
//! - logic: `!` / `not`, `&&` / `and`, `||` / `or`, parentheses
//!
//! Unknown paths resolve to `null`. A bare value is tested for truthiness:
//! `null`, `false`, `0`, `""` and empty collections are false.

use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{ConditionEvaluator, ConditionScope};

/// Deepest allowed nesting of `(` and `!`/`not`.
const MAX_DEPTH: usize = 64;
/// Longest accepted expression, in tokens. Bounds the depth of `&&`/`||` chains.
const MAX_TOKENS: usize = 1024;

/// The built-in [`ConditionEvaluator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, expr: &str, scope: &ConditionScope<'_>) -> Result<bool> {
        let tokens = tokenize(expr)?;
        if tokens.len() > MAX_TOKENS {
            return Err(TrellisError::Condition(format!(
                "expression longer than {} tokens",
                MAX_TOKENS
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let ast = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(TrellisError::Condition(format!(
                "unexpected token {:?} in `{}`",
                parser.tokens[parser.pos], expr
            )));
        }
        Ok(truthy(&ast.eval(scope)))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Str(String),
    Num(f64),
    Ident(String),
    Op(CmpOp),
    Not,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(TrellisError::Condition(format!(
                                "unterminated string in `{}`",
                                expr
                            )))
                        }
                        Some('\\') if i + 1 < chars.len() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    TrellisError::Condition(format!("invalid number `{}` in `{}`", text, expr))
                })?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(TrellisError::Condition(format!(
                    "unexpected character `{}` in `{}`",
                    other, expr
                )))
            }
        }
    }

    if tokens.is_empty() {
        return Err(TrellisError::Condition("empty expression".to_string()));
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(TrellisError::Condition(
                "expression nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TrellisError::Condition("missing `)`".to_string())),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Path(word),
            }),
            Some(other) => Err(TrellisError::Condition(format!(
                "unexpected token {:?}",
                other
            ))),
            None => Err(TrellisError::Condition(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl Expr {
    fn eval(&self, scope: &ConditionScope<'_>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => scope.lookup(path).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
            Expr::And(l, r) => Value::Bool(truthy(&l.eval(scope)) && truthy(&r.eval(scope))),
            Expr::Or(l, r) => Value::Bool(truthy(&l.eval(scope)) || truthy(&r.eval(scope))),
            Expr::Compare(l, op, r) => Value::Bool(compare(&l.eval(scope), *op, &r.eval(scope))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => ordering.map(|o| o == Ordering::Equal).unwrap_or(left == right),
        CmpOp::Ne => !ordering.map(|o| o == Ordering::Equal).unwrap_or(left == right),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::types::Variables;

    fn eval(expr: &str) -> Result<bool> {
        let mut vars = Variables::new();
        vars.insert("status".into(), json!("success"));
        vars.insert("score".into(), json!(7));
        vars.insert("ratio".into(), json!(0.5));
        vars.insert("tags".into(), json!(["alpha", "beta"]));
        vars.insert("output".into(), json!("The file was created successfully."));
        vars.insert("empty".into(), json!(""));
        let mut results = Variables::new();
        results.insert("fetch".into(), json!({"count": 3, "ok": true}));
        let scope = ConditionScope::new(&vars, &results);
        ExpressionEvaluator.evaluate(expr, &scope)
    }

    #[test]
    fn test_equality() {
        assert!(eval(r#"status == "success""#).unwrap());
        assert!(!eval(r#"status == "failure""#).unwrap());
        assert!(eval(r#"status != 'failure'"#).unwrap());
        assert!(eval("score == 7").unwrap());
        assert!(eval("score == 7.0").unwrap());
    }

    #[test]
    fn test_ordering() {
        assert!(eval("score > 5").unwrap());
        assert!(eval("score >= 7").unwrap());
        assert!(!eval("score < 7").unwrap());
        assert!(eval("ratio <= 0.5").unwrap());
        assert!(eval("results.fetch.count < score").unwrap());
        assert!(eval("-1 < 0").unwrap());
    }

    #[test]
    fn test_contains() {
        assert!(eval(r#"output contains "created""#).unwrap());
        assert!(!eval(r#"output contains "deleted""#).unwrap());
        assert!(eval(r#"tags contains "beta""#).unwrap());
        assert!(eval(r#"results.fetch contains "count""#).unwrap());
    }

    #[test]
    fn test_logic_and_grouping() {
        assert!(eval(r#"status == "success" && score > 5"#).unwrap());
        assert!(eval(r#"status == "failure" or score > 5"#).unwrap());
        assert!(!eval(r#"not (score > 5)"#).unwrap());
        assert!(eval(r#"!(status == "failure" || score < 0) and results.fetch.ok"#).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("true").unwrap());
        assert!(!eval("false").unwrap());
        assert!(!eval("null").unwrap());
        assert!(!eval("missing").unwrap());
        assert!(!eval("empty").unwrap());
        assert!(eval("tags").unwrap());
        assert!(eval("results.fetch.ok").unwrap());
    }

    #[test]
    fn test_missing_key_compares_as_null() {
        assert!(!eval(r#"missing == "value""#).unwrap());
        assert!(eval("missing == null").unwrap());
        assert!(!eval("missing > 3").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(eval("this is not valid"), Err(TrellisError::Condition(_))));
        assert!(matches!(eval("(score > 5"), Err(TrellisError::Condition(_))));
        assert!(matches!(eval(r#"status == "open"#), Err(TrellisError::Condition(_))));
        assert!(matches!(eval(""), Err(TrellisError::Condition(_))));
        assert!(matches!(eval("score >"), Err(TrellisError::Condition(_))));
        assert!(matches!(eval("a = b"), Err(TrellisError::Condition(_))));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let negations = format!("{}true", "!".repeat(100));
        match eval(&negations) {
            Err(TrellisError::Condition(msg)) => assert_eq!(msg, "expression nested too deeply"),
            other => panic!("expected condition error, got {:?}", other),
        }
        let flood = format!("{}true", "!".repeat(200_000));
        assert!(matches!(eval(&flood), Err(TrellisError::Condition(_))));

        let parens = format!("{}true{}", "(".repeat(65), ")".repeat(65));
        match eval(&parens) {
            Err(TrellisError::Condition(msg)) => assert_eq!(msg, "expression nested too deeply"),
            other => panic!("expected condition error, got {:?}", other),
        }

        let chain = vec!["score > 1"; 2_000].join(" && ");
        assert!(matches!(eval(&chain), Err(TrellisError::Condition(_))));

        // Moderate nesting still evaluates.
        assert!(eval(&format!("{}true{}", "(".repeat(32), ")".repeat(32))).unwrap());
        assert!(eval(&format!("{}true", "!".repeat(20))).unwrap());
    }
}
