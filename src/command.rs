//! Command string parsing and variable interpolation.
//!
//! ADDRESS commands arrive as a single string: a leading bare operation
//! token followed by `key=value` pairs. Values may be double-quoted to
//! carry whitespace, and quoted values may contain escaped quotes because
//! script bodies frequently embed quoted strings:
//!
//! ```text
//! execute_rexx container="w1" script="SAY \"hello\""
//! ```
//!
//! Parsing does no type coercion. Callers consume string values and
//! coerce per their own recognized-option table.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Variable context supplied by the host scripting runtime for `{name}`
/// placeholder interpolation.
pub type VarContext = HashMap<String, String>;

/// A parsed ADDRESS command: operation name plus ordered parameters.
///
/// Parameters preserve the order they appeared in the command string.
/// Duplicate keys keep the first occurrence on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Operation name (the leading bare token).
    pub operation: String,
    params: Vec<(String, String)>,
}

impl Command {
    /// Looks up a parameter value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a required parameter, or the canonical missing-parameter error.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::MissingParameter {
            operation: self.operation.clone(),
            parameter: key.to_string(),
        })
    }

    /// Returns the first present parameter among `keys`, or a
    /// missing-parameter error naming all of them.
    pub fn require_any(&self, keys: &[&str]) -> Result<&str> {
        keys.iter()
            .find_map(|k| self.get(k))
            .ok_or_else(|| Error::MissingParameter {
                operation: self.operation.clone(),
                parameter: keys.join("|"),
            })
    }

    /// Interprets a parameter as a boolean flag. Absent keys are false.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1") | Some("yes"))
    }

    /// Parses a numeric parameter, if present.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<u64>().map(Some).map_err(|_| Error::InvalidParameter {
                parameter: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// Parses a numeric parameter, if present.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<u32>().map(Some).map_err(|_| Error::InvalidParameter {
                parameter: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// Iterates parameters in the order they appeared.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Resolves `{name}` placeholders in every parameter value against the
    /// caller's variable context. Unresolved placeholders stay verbatim.
    pub fn interpolate(&mut self, ctx: &VarContext) {
        for (_, value) in &mut self.params {
            *value = interpolate(value, ctx);
        }
    }
}

/// Parses a raw command string into a [`Command`].
///
/// Tokenizes on whitespace outside double quotes. A `key="value"` or
/// `key=bareToken` pair populates the parameter list; the leading bare
/// token becomes the operation. An unterminated quote is a parse error.
pub fn parse(raw: &str) -> Result<Command> {
    let tokens = tokenize(raw)?;
    let mut iter = tokens.into_iter();

    let operation = match iter.next() {
        Some(tok) if !tok.contains('=') => tok,
        Some(tok) => {
            return Err(Error::Parse(format!(
                "expected operation name, found parameter '{}'",
                tok.split('=').next().unwrap_or(&tok)
            )))
        }
        None => return Err(Error::Parse("empty command".to_string())),
    };

    let mut params = Vec::new();
    for tok in iter {
        match tok.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(Error::Parse(format!(
                    "expected key=value pair, found '{}'",
                    tok
                )))
            }
        }
    }

    Ok(Command {
        operation,
        params,
    })
}

/// Splits the raw string into tokens, honoring double quotes and `\"`
/// escapes inside quoted sections. Quote characters are stripped; escaped
/// quotes are unescaped into the token.
fn tokenize(raw: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err(Error::Parse("unterminated quote".to_string()));
    }
    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Substitutes each `{identifier}` occurrence by looking it up in the
/// caller's variable context. Unresolved placeholders are left verbatim;
/// callers may intend literal braces.
pub fn interpolate(value: &str, ctx: &VarContext) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_identifier(&after[..close]) => {
                let name = &after[..close];
                match ctx.get(name) {
                    Some(replacement) => out.push_str(replacement),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escapes a value for embedding in a quoted command-string position.
///
/// Used when composing internal commands (the orchestrator delegates to
/// handlers through the same command grammar callers use).
pub fn quote(value: &str) -> String {
    let escaped = value.replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operation_and_bare_params() {
        let cmd = parse("create image=debian:stable name=w1").unwrap();
        assert_eq!(cmd.operation, "create");
        assert_eq!(cmd.get("image"), Some("debian:stable"));
        assert_eq!(cmd.get("name"), Some("w1"));
    }

    #[test]
    fn quoted_value_keeps_spaces() {
        let cmd = parse(r#"execute command="echo hello world""#).unwrap();
        assert_eq!(cmd.get("command"), Some("echo hello world"));
    }

    #[test]
    fn escaped_quotes_inside_script_bodies() {
        let cmd = parse(r#"execute_rexx script="SAY \"hi there\"""#).unwrap();
        assert_eq!(cmd.get("script"), Some(r#"SAY "hi there""#));
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        let err = parse(r#"create name="broken"#).unwrap_err();
        assert!(err.to_string().contains("unterminated quote"));
    }

    #[test]
    fn unresolved_placeholder_stays_verbatim() {
        let ctx = VarContext::new();
        assert_eq!(interpolate("path/{missing}/x", &ctx), "path/{missing}/x");
    }

    #[test]
    fn quote_round_trips_through_parser() {
        let raw = format!("execute command={}", quote(r#"say "hi""#));
        let cmd = parse(&raw).unwrap();
        assert_eq!(cmd.get("command"), Some(r#"say "hi""#));
    }
}
