// Conditional Reference Validator & Evaluator
//
// Static validation of ref/if wiring across a step list, and runtime
// evaluation of `if` expressions against prior step outputs. The expression
// grammar is deliberately tiny: `&&`, `||`, parentheses, the comparison
// operators, `refs.*` paths, and scalar literals. No arbitrary code.

use std::collections::HashSet;

use regex::Regex;
use relay_shared::StepDefinition;
use serde_json::Value;

use super::{AutomationError, accessor};

/// Statically validate a step list before it is accepted into a run.
///
/// Fails with `DuplicateStepRefsDefined` when two steps declare the same
/// `ref`, and with `InvalidStepReference` when an `if` expression names a
/// ref no step declares. Declaration order is not enforced; a list with no
/// refs and no conditionals is trivially valid.
pub fn validate_conditional_refs(steps: &[StepDefinition]) -> Result<(), AutomationError> {
    let mut declared: HashSet<&str> = HashSet::new();
    for step in steps {
        if let Some(name) = step.step_ref.as_deref() {
            if !declared.insert(name) {
                return Err(AutomationError::DuplicateStepRefsDefined(name.to_string()));
            }
        }
    }

    let ref_token = Regex::new(r"\brefs\.([A-Za-z0-9_-]+)").unwrap();
    for step in steps {
        if let Some(expr) = step.condition.as_deref() {
            for capture in ref_token.captures_iter(expr) {
                let name = &capture[1];
                if !declared.contains(name) {
                    return Err(AutomationError::InvalidStepReference(format!(
                        "refs.{}",
                        name
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Evaluate a step's `if` expression against the run context snapshot.
///
/// `refs.<name>.<path>` operands resolve with the accessor semantics
/// (missing path degrades to null); the expression then reduces with the
/// comparison operators over numbers, strings and enum-like literals, and
/// `&&`/`||` over truthiness. A malformed expression is a definition error.
pub fn evaluate(expr: &str, context: &Value) -> Result<bool, AutomationError> {
    let tokens = lex(expr)
        .map_err(|e| AutomationError::InvalidStepDefinition(format!("bad condition '{expr}': {e}")))?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        context,
    };
    let value = parser
        .parse_or()
        .map_err(|e| AutomationError::InvalidStepDefinition(format!("bad condition '{expr}': {e}")))?;
    if parser.pos != tokens.len() {
        return Err(AutomationError::InvalidStepDefinition(format!(
            "bad condition '{expr}': unexpected trailing input"
        )));
    }
    Ok(truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    LParen,
    RParen,
}

fn lex(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err("expected '&&'".to_string());
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err("expected '||'".to_string());
                }
                tokens.push(Token::Or);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected '=='".to_string());
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected '!='".to_string());
                }
                tokens.push(Token::Ne);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s.parse::<f64>().map_err(|_| format!("bad number '{s}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '$' || d == '-' || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    context: &'a Value,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Value, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, String> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Value, String> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Lt) => Token::Lt,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Le) => Token::Le,
            Some(Token::Ge) => Token::Ge,
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_primary()?;
        Ok(Value::Bool(compare(&op, &left, &right)))
    }

    fn parse_primary(&mut self) -> Result<Value, String> {
        match self.next().cloned() {
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Number(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(ident)) => Ok(self.resolve_ident(&ident)),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    /// Operand resolution: `true`/`false`/`null` keywords, context paths
    /// (`refs.*`, `data.*`, `profile.*`, ...) looked up in the context
    /// snapshot (missing resolves to null), and anything else treated as an
    /// enum-like literal whose value is its final dotted segment
    /// (`MessageStatus.Opened` compares as `"Opened"`).
    fn resolve_ident(&self, ident: &str) -> Value {
        const ROOTS: [&str; 6] = ["refs", "data", "profile", "recipient", "template", "brand"];
        match ident {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            path if ROOTS
                .iter()
                .any(|root| path == *root || path.starts_with(&format!("{root}."))) =>
            {
                accessor::lookup(self.context, path)
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            other => {
                let last = other.rsplit('.').next().unwrap_or(other);
                Value::String(last.to_string())
            }
        }
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> bool {
    match op {
        Token::Eq => loose_eq(left, right),
        Token::Ne => !loose_eq(left, right),
        _ => {
            if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
                match op {
                    Token::Lt => l < r,
                    Token::Gt => l > r,
                    Token::Le => l <= r,
                    Token::Ge => l >= r,
                    _ => false,
                }
            } else if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
                match op {
                    Token::Lt => l < r,
                    Token::Gt => l > r,
                    Token::Le => l <= r,
                    Token::Ge => l >= r,
                    _ => false,
                }
            } else {
                false
            }
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::{Field, StepAction};
    use serde_json::json;

    fn send_step() -> StepDefinition {
        StepDefinition::new(StepAction::Send {
            template: Field::literal(json!("welcome")),
            recipient: None,
            profile: None,
            data: None,
            brand: None,
        })
    }

    #[test]
    fn test_validate_trivially_valid() {
        let steps = vec![send_step(), send_step()];
        assert!(validate_conditional_refs(&steps).is_ok());
    }

    #[test]
    fn test_validate_duplicate_refs() {
        let steps = vec![
            send_step().with_ref("outreach"),
            send_step().with_ref("outreach"),
        ];
        match validate_conditional_refs(&steps) {
            Err(AutomationError::DuplicateStepRefsDefined(name)) => {
                assert_eq!(name, "outreach");
            }
            other => panic!("expected duplicate-refs error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_undeclared_ref() {
        let steps = vec![
            send_step().with_ref("ref1"),
            send_step().with_condition("refs.ref1.prop && refs.ghost.prop"),
        ];
        match validate_conditional_refs(&steps) {
            Err(AutomationError::InvalidStepReference(name)) => {
                assert_eq!(name, "refs.ghost");
            }
            other => panic!("expected invalid-reference error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_three_refs_combined_expression() {
        let steps = vec![
            send_step().with_ref("ref1"),
            send_step().with_ref("ref2"),
            send_step().with_ref("ref3"),
            send_step().with_condition("refs.ref1.prop && refs.ref2.prop || refs.ref3.prop"),
        ];
        assert!(validate_conditional_refs(&steps).is_ok());
    }

    #[test]
    fn test_validate_order_not_enforced() {
        let steps = vec![
            send_step().with_condition("refs.later.status == 'SENT'"),
            send_step().with_ref("later"),
        ];
        assert!(validate_conditional_refs(&steps).is_ok());
    }

    #[test]
    fn test_evaluate_comparisons() {
        let ctx = json!({ "refs": { "outreach": { "status": "SENT", "count": 3 } } });
        assert!(evaluate("refs.outreach.status == 'SENT'", &ctx).unwrap());
        assert!(!evaluate("refs.outreach.status != 'SENT'", &ctx).unwrap());
        assert!(evaluate("refs.outreach.count > 2", &ctx).unwrap());
        assert!(evaluate("refs.outreach.count <= 3", &ctx).unwrap());
        assert!(!evaluate("refs.outreach.count >= 4", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_boolean_combinators() {
        let ctx = json!({ "refs": { "a": { "ok": true }, "b": { "ok": false } } });
        assert!(evaluate("refs.a.ok || refs.b.ok", &ctx).unwrap());
        assert!(!evaluate("refs.a.ok && refs.b.ok", &ctx).unwrap());
        // && binds tighter than ||
        assert!(evaluate("refs.b.ok && refs.b.ok || refs.a.ok", &ctx).unwrap());
        assert!(!evaluate("refs.b.ok && (refs.b.ok || refs.a.ok)", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_missing_ref_degrades_to_null() {
        let ctx = json!({ "refs": {} });
        assert!(!evaluate("refs.ghost.prop", &ctx).unwrap());
        assert!(evaluate("refs.ghost.prop == null", &ctx).unwrap());
        assert!(!evaluate("refs.ghost.prop == 'SENT'", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_context_roots_beyond_refs() {
        let ctx = json!({ "data": { "plan": "free" }, "profile": { "locale": "fr-FR" } });
        assert!(evaluate("data.plan == 'free'", &ctx).unwrap());
        assert!(!evaluate("data.plan == 'enterprise'", &ctx).unwrap());
        assert!(evaluate("profile.locale != null", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_enum_like_literal() {
        let ctx = json!({ "refs": { "msg": { "status": "Opened" } } });
        assert!(evaluate("refs.msg.status == MessageStatus.Opened", &ctx).unwrap());
        assert!(!evaluate("refs.msg.status == MessageStatus.Clicked", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_numeric_string_equality() {
        let ctx = json!({ "refs": { "r": { "n": 3 } } });
        assert!(evaluate("refs.r.n == 3", &ctx).unwrap());
        assert!(evaluate("refs.r.n != 4", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_rejects_malformed_expression() {
        let ctx = json!({});
        assert!(evaluate("refs.a.b &&", &ctx).is_err());
        assert!(evaluate("refs.a.b ==", &ctx).is_err());
        assert!(evaluate("(refs.a.b", &ctx).is_err());
        assert!(evaluate("refs.a.b @ 1", &ctx).is_err());
    }
}
