//! Parser for the compact text form
//!
//! ```text
//! all
//! uid % 2 == 0
//! kv.city == "sh"
//! kv.age >= 18
//! and(uid % 2 == 0, kv.city != "bj")
//! or(kv.vip == "1", not(kv.age < 18))
//! ```

use crate::ast::{CmpOp, Expr};
use crate::error::{ExprError, Result};
use std::str::FromStr;

impl FromStr for Expr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

impl Expr {
    /// Parse the compact text form
    pub fn parse(text: &str) -> Result<Self> {
        parse(text)
    }
}

fn err(text: &str, reason: impl Into<String>) -> ExprError {
    ExprError::Parse {
        text: text.to_string(),
        reason: reason.into(),
    }
}

fn parse(text: &str) -> Result<Expr> {
    let s = text.trim();

    if s.eq_ignore_ascii_case("all") {
        return Ok(Expr::All);
    }

    for name in ["and", "or", "not"] {
        if let Some(inner) = call_body(s, name) {
            let parts = split_args(inner).map_err(|r| err(text, r))?;
            if parts.is_empty() {
                return Err(err(text, format!("{name}() needs arguments")));
            }
            let children = parts
                .into_iter()
                .map(parse)
                .collect::<Result<Vec<_>>>()?;
            return Ok(match name {
                "and" => Expr::And(children),
                "or" => Expr::Or(children),
                _ => {
                    if children.len() != 1 {
                        return Err(err(text, "not() takes exactly one argument"));
                    }
                    Expr::Not(Box::new(children.into_iter().next().expect("one child")))
                }
            });
        }
    }

    if let Some(rest) = s.strip_prefix("uid") {
        return parse_uid_mod(text, rest);
    }

    if let Some(rest) = s.strip_prefix("kv.") {
        return parse_field(text, rest);
    }

    Err(err(text, "expected all, uid, kv., and(), or(), not()"))
}

/// `name(...)` with the closing paren at the end of the string
fn call_body<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(name)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    rest.strip_suffix(')')
}

/// Split at top-level commas, respecting parentheses and quotes
fn split_args(s: &str) -> std::result::Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;

    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth = depth.checked_sub(1).ok_or("unbalanced parentheses")?;
            }
            ',' if !in_quotes && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quotes || depth != 0 {
        return Err("unbalanced quotes or parentheses".to_string());
    }

    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    Ok(parts)
}

/// `% N == K` after the leading `uid`
fn parse_uid_mod(text: &str, rest: &str) -> Result<Expr> {
    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('%')
        .ok_or_else(|| err(text, "expected 'uid % N == K'"))?;
    let (modulus, rest) = take_number(rest).ok_or_else(|| err(text, "expected modulus"))?;
    let rest = rest
        .trim_start()
        .strip_prefix("==")
        .ok_or_else(|| err(text, "expected '=='"))?;
    let (remainder, rest) = take_number(rest).ok_or_else(|| err(text, "expected remainder"))?;
    if !rest.trim().is_empty() {
        return Err(err(text, "trailing input"));
    }
    if modulus == 0 {
        return Err(ExprError::ZeroModulus);
    }

    Ok(Expr::UserIdMod { modulus, remainder })
}

fn take_number(s: &str) -> Option<(u32, &str)> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok().map(|n| (n, &s[end..]))
}

/// `KEY OP VALUE` after the leading `kv.`
fn parse_field(text: &str, rest: &str) -> Result<Expr> {
    let key_end = rest
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || matches!(c, '=' | '!' | '<' | '>'))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let key = &rest[..key_end];
    if key.is_empty() {
        return Err(err(text, "expected field key"));
    }

    let rest = rest[key_end..].trim_start();
    let (op, rest) = if let Some(r) = rest.strip_prefix("==") {
        (CmpOp::Eq, r)
    } else if let Some(r) = rest.strip_prefix("!=") {
        (CmpOp::Ne, r)
    } else if let Some(r) = rest.strip_prefix(">=") {
        (CmpOp::Ge, r)
    } else if let Some(r) = rest.strip_prefix("<=") {
        (CmpOp::Le, r)
    } else if let Some(r) = rest.strip_prefix('>') {
        (CmpOp::Gt, r)
    } else if let Some(r) = rest.strip_prefix('<') {
        (CmpOp::Lt, r)
    } else {
        return Err(err(text, "expected comparison operator"));
    };

    let value = rest.trim();
    if value.is_empty() {
        return Err(err(text, "expected value"));
    }
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    Ok(Expr::Field {
        key: key.to_string(),
        op,
        value: value.to_string(),
    })
}
