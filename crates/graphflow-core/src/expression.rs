//! Sandboxed condition language for conditional edges and loop breaks.
//!
//! Grammar:
//! - Literals: string (single or double quoted), number, `true`, `false`, `null`
//! - Field access: dotted paths resolved against the scope object
//!   (`score`, `conditions.check`, `loops.retry`)
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`, `contains`
//! - Logical: `&&`, `||`, `!`, parentheses
//!
//! Precedence: `!` > comparison > `&&` > `||`. Numbers compare as f64, so `1`
//! and `1.0` are equal. Missing paths resolve to `null`; comparisons against a
//! missing value are false rather than an error. There are no function calls,
//! no assignment and no side effects.

use serde_json::Value;

use crate::error::{FlowError, Result};

/// A parsed expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse an expression, failing on syntax errors.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(parse_error("empty expression"));
        }
        let (ast, rest) = parse_or(&tokens)?;
        if let Some(tok) = rest.first() {
            return Err(parse_error(&format!("unexpected token: {:?}", tok)));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a scope object and coerce the result to a boolean.
    pub fn evaluate(&self, scope: &Value) -> bool {
        eval(&self.ast, scope).truthy()
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, scope: &Value) -> Result<bool> {
    Ok(Expression::parse(source)?.evaluate(scope))
}

fn parse_error(message: &str) -> FlowError {
    FlowError::Expression(message.to_string())
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if peek(&chars, i + 1) == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if peek(&chars, i + 1) == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = chars[i];
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(parse_error("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1; // closing quote
            }
            c if c.is_ascii_digit()
                || (c == '-' && peek(&chars, i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                if c == '-' {
                    i += 1;
                }
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| parse_error(&format!("invalid number: {}", num_str)))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '.'
                        || chars[i] == '-')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "contains" => Token::Contains,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(parse_error(&format!("unexpected character: {}", other)));
            }
        }
    }
    Ok(tokens)
}

fn peek(chars: &[char], idx: usize) -> Option<char> {
    chars.get(idx).copied()
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

type ParseResult<'a> = Result<(Expr, &'a [Token])>;

/// or_expr = and_expr ( "||" and_expr )*
fn parse_or(tokens: &[Token]) -> ParseResult<'_> {
    let (mut left, mut rest) = parse_and(tokens)?;
    while rest.first() == Some(&Token::Or) {
        let (right, r) = parse_and(&rest[1..])?;
        left = Expr::Or(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

/// and_expr = not_expr ( "&&" not_expr )*
fn parse_and(tokens: &[Token]) -> ParseResult<'_> {
    let (mut left, mut rest) = parse_not(tokens)?;
    while rest.first() == Some(&Token::And) {
        let (right, r) = parse_not(&rest[1..])?;
        left = Expr::And(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

/// not_expr = "!" not_expr | comparison
fn parse_not(tokens: &[Token]) -> ParseResult<'_> {
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_not(&tokens[1..])?;
        return Ok((Expr::Not(Box::new(inner)), rest));
    }
    parse_comparison(tokens)
}

/// comparison = primary ( op primary )?
fn parse_comparison(tokens: &[Token]) -> ParseResult<'_> {
    let (left, rest) = parse_primary(tokens)?;
    let op = match rest.first() {
        Some(Token::Eq) => CompOp::Eq,
        Some(Token::Ne) => CompOp::Ne,
        Some(Token::Gt) => CompOp::Gt,
        Some(Token::Lt) => CompOp::Lt,
        Some(Token::Ge) => CompOp::Ge,
        Some(Token::Le) => CompOp::Le,
        Some(Token::Contains) => CompOp::Contains,
        _ => return Ok((left, rest)),
    };
    let (right, rest) = parse_primary(&rest[1..])?;
    Ok((Expr::Compare(Box::new(left), op, Box::new(right)), rest))
}

/// primary = literal | path | "(" or_expr ")"
fn parse_primary(tokens: &[Token]) -> ParseResult<'_> {
    let Some(first) = tokens.first() else {
        return Err(parse_error("unexpected end of expression"));
    };
    let rest = &tokens[1..];
    match first {
        Token::Str(s) => Ok((Expr::Literal(Value::String(s.clone())), rest)),
        Token::Num(n) => Ok((Expr::Literal(number(*n)), rest)),
        Token::Bool(b) => Ok((Expr::Literal(Value::Bool(*b)), rest)),
        Token::Null => Ok((Expr::Literal(Value::Null), rest)),
        Token::Ident(path) => Ok((Expr::Path(path.clone()), rest)),
        Token::LParen => {
            let (inner, rest) = parse_or(rest)?;
            match rest.first() {
                Some(Token::RParen) => Ok((inner, &rest[1..])),
                _ => Err(parse_error("missing closing parenthesis")),
            }
        }
        other => Err(parse_error(&format!("expected value, got {:?}", other))),
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

struct Evaluated(Value);

impl Evaluated {
    fn truthy(&self) -> bool {
        truthy(&self.0)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn eval(expr: &Expr, scope: &Value) -> Evaluated {
    match expr {
        Expr::Literal(v) => Evaluated(v.clone()),
        Expr::Path(path) => Evaluated(resolve_path(scope, path).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => Evaluated(Value::Bool(!eval(inner, scope).truthy())),
        Expr::And(l, r) => {
            Evaluated(Value::Bool(eval(l, scope).truthy() && eval(r, scope).truthy()))
        }
        Expr::Or(l, r) => {
            Evaluated(Value::Bool(eval(l, scope).truthy() || eval(r, scope).truthy()))
        }
        Expr::Compare(l, op, r) => {
            let left = eval(l, scope).0;
            let right = eval(r, scope).0;
            Evaluated(Value::Bool(compare(&left, &right, *op)))
        }
    }
}

/// Resolve a dotted path against a JSON value. Numeric segments index arrays.
///
/// Keys may themselves contain dots (such as a tool's `node.tool` output key):
/// at each level the longest matching key prefix is tried first, falling back
/// to shorter prefixes when the remainder does not resolve.
pub fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(found) = child(data, path) {
        return Some(found);
    }
    path.rmatch_indices('.').find_map(|(at, _)| {
        let next = child(data, &path[..at])?;
        resolve_path(next, &path[at + 1..])
    })
}

fn child<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    match data {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(key.parse::<usize>().ok()?),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value, op: CompOp) -> bool {
    if op == CompOp::Contains {
        return match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        };
    }

    if left.is_null() || right.is_null() {
        let both_null = left.is_null() && right.is_null();
        return match op {
            CompOp::Eq => both_null,
            CompOp::Ne => !both_null,
            _ => false,
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        let eq = (l - r).abs() < f64::EPSILON;
        return match op {
            CompOp::Eq => eq,
            CompOp::Ne => !eq,
            CompOp::Gt => l > r && !eq,
            CompOp::Lt => l < r && !eq,
            CompOp::Ge => l >= r || eq,
            CompOp::Le => l <= r || eq,
            CompOp::Contains => false,
        };
    }

    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l >= r,
            CompOp::Le => l <= r,
            CompOp::Contains => false,
        };
    }

    // Structural equality for bools, arrays and objects; ordering is undefined.
    match op {
        CompOp::Eq => left == right,
        CompOp::Ne => left != right,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_and_inequality() {
        let scope = json!({"finish_reason": "stop"});
        assert!(evaluate(r#"finish_reason == "stop""#, &scope).unwrap());
        assert!(!evaluate(r#"finish_reason != 'stop'"#, &scope).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let scope = json!({"score": 0.5, "count": 1});
        assert!(evaluate("score >= 0.5", &scope).unwrap());
        assert!(!evaluate("score > 0.5", &scope).unwrap());
        assert!(evaluate("score <= 0.5 && score < 0.6", &scope).unwrap());
        assert!(evaluate("count == 1.0", &scope).unwrap());
    }

    #[test]
    fn test_logical_operators_and_precedence() {
        let scope = json!({"a": 1, "b": 2, "done": false});
        assert!(evaluate("a == 1 || b == 99 && done", &scope).unwrap());
        assert!(!evaluate("(a == 1 || b == 99) && done", &scope).unwrap());
        assert!(evaluate("!done", &scope).unwrap());
        assert!(evaluate("!(a == 2)", &scope).unwrap());
    }

    #[test]
    fn test_contains() {
        let scope = json!({
            "text": "hello world",
            "tags": ["a", "b"],
            "nums": [1, 2],
            "map": {"k": 1}
        });
        assert!(evaluate("text contains 'world'", &scope).unwrap());
        assert!(!evaluate("text contains 'mars'", &scope).unwrap());
        assert!(evaluate("tags contains 'b'", &scope).unwrap());
        assert!(evaluate("nums contains 2.0", &scope).unwrap());
        assert!(evaluate("map contains 'k'", &scope).unwrap());
        assert!(!evaluate("missing contains 'x'", &scope).unwrap());
    }

    #[test]
    fn test_nested_paths_and_array_index() {
        let scope = json!({"conditions": {"check": true}, "items": [{"name": "x"}]});
        assert!(evaluate("conditions.check", &scope).unwrap());
        assert!(evaluate("items.0.name == 'x'", &scope).unwrap());
        assert_eq!(resolve_path(&scope, "items.1"), None);

        let dotted = json!({"fetch.echo": {"ok": true}, "fetch": {"other": 1}});
        assert_eq!(resolve_path(&dotted, "fetch.echo.ok"), Some(&json!(true)));
        assert_eq!(resolve_path(&dotted, "fetch.other"), Some(&json!(1)));
        assert_eq!(resolve_path(&dotted, "fetch.echo.missing"), None);

        let listed = json!({"search.lookup": [{"id": "a"}, {"id": "b"}]});
        assert_eq!(resolve_path(&listed, "search.lookup.1.id"), Some(&json!("b")));
        assert!(evaluate("search.lookup.0.id == 'a'", &listed).unwrap());
    }

    #[test]
    fn test_missing_field_is_false_not_error() {
        let scope = json!({"other": 1});
        assert!(!evaluate(r#"missing == "x""#, &scope).unwrap());
        assert!(evaluate("missing == null", &scope).unwrap());
        assert!(!evaluate("missing > 3", &scope).unwrap());
    }

    #[test]
    fn test_truthiness_of_bare_values() {
        let scope = json!({"empty": "", "list": [1], "zero": 0});
        assert!(!evaluate("empty", &scope).unwrap());
        assert!(evaluate("list", &scope).unwrap());
        assert!(!evaluate("zero", &scope).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(evaluate("", &json!({})).is_err());
        assert!(evaluate("==", &json!({})).is_err());
        assert!(evaluate("(a == 1", &json!({})).is_err());
        assert!(evaluate("'open", &json!({})).is_err());
        assert!(evaluate("a = 1", &json!({})).is_err());
        assert!(matches!(
            Expression::parse("a ==").unwrap_err(),
            FlowError::Expression(_)
        ));
    }

    #[test]
    fn test_parsed_expression_is_reusable() {
        let expr = Expression::parse("loops.l >= 3").unwrap();
        assert_eq!(expr.source(), "loops.l >= 3");
        assert!(!expr.evaluate(&json!({"loops": {"l": 2}})));
        assert!(expr.evaluate(&json!({"loops": {"l": 3}})));
    }
}
