//! Lexical parser for model action calls.
//!
//! The model emits one call per step, in one of two shapes:
//!
//! ```text
//! do(action="Tap", element=[500, 300])
//! finish(message="done")
//! ```
//!
//! Parsing is strictly lexical. The call is tokenized into keyword arguments
//! (quoted strings with backslash escapes, two-integer bracket lists, bare
//! numbers); anything outside the two shapes is rejected.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::types::{Action, RelPoint};

/// Action parse errors.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("not a do()/finish() call: {0}")]
    UnknownCall(String),
    #[error("unknown action verb: {0}")]
    UnknownVerb(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid parameter `{name}`: {detail}")]
    InvalidParameter { name: &'static str, detail: String },
    #[error("malformed argument list: {0}")]
    MalformedArguments(String),
}

/// A parsed keyword-argument value.
#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Str(String),
    List(Vec<i64>),
    Num(f64),
}

/// Parse one action call into an [`Action`].
pub fn parse_action(text: &str) -> Result<Action, ParseError> {
    let text = text.trim();

    if let Some(inner) = call_body(text, "do") {
        let args = parse_kwargs(inner)?;
        return build_do(args);
    }
    if let Some(inner) = call_body(text, "finish") {
        let args = parse_kwargs(inner)?;
        let message = take_string(&args, "message").unwrap_or_default();
        return Ok(Action::Finish { message });
    }

    Err(ParseError::UnknownCall(truncate(text, 120)))
}

/// Return the argument text of `name(...)` when `text` is exactly that call.
fn call_body<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(name)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let rest = rest.trim_end();
    rest.strip_suffix(')')
}

/// Tokenize `key=value, key=value, …`.
fn parse_kwargs(content: &str) -> Result<HashMap<String, Arg>, ParseError> {
    let mut args = HashMap::new();
    let mut chars = content.chars().peekable();

    loop {
        // skip separators
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        // key
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                key.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if key.is_empty() {
            return Err(ParseError::MalformedArguments(format!(
                "expected identifier near `{}`",
                chars.clone().take(20).collect::<String>()
            )));
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(ParseError::MalformedArguments(format!(
                "expected `=` after `{}`",
                key
            )));
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        // value
        let value = match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => s.push(c),
                    }
                }
                if !closed {
                    return Err(ParseError::MalformedArguments(format!(
                        "unterminated string for `{}`",
                        key
                    )));
                }
                Arg::Str(s)
            }
            Some('[') => {
                chars.next();
                let mut items = Vec::new();
                let mut current = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        ',' => {
                            items.push(std::mem::take(&mut current));
                        }
                        c => current.push(c),
                    }
                }
                if !closed {
                    return Err(ParseError::MalformedArguments(format!(
                        "unterminated list for `{}`",
                        key
                    )));
                }
                if !current.trim().is_empty() {
                    items.push(current);
                }
                let mut numbers = Vec::with_capacity(items.len());
                for item in items {
                    let n = item.trim().parse::<f64>().map_err(|_| {
                        ParseError::MalformedArguments(format!(
                            "non-numeric list item `{}` for `{}`",
                            item.trim(),
                            key
                        ))
                    })?;
                    numbers.push(n.round() as i64);
                }
                Arg::List(numbers)
            }
            _ => {
                let mut raw = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    raw.push(c);
                    chars.next();
                }
                let raw = raw.trim().to_string();
                if raw.is_empty() {
                    return Err(ParseError::MalformedArguments(format!(
                        "missing value for `{}`",
                        key
                    )));
                }
                match raw.parse::<f64>() {
                    Ok(n) => Arg::Num(n),
                    Err(_) => Arg::Str(raw),
                }
            }
        };

        args.insert(key, value);
    }

    Ok(args)
}

fn build_do(args: HashMap<String, Arg>) -> Result<Action, ParseError> {
    let verb = take_string(&args, "action").ok_or(ParseError::MissingParameter("action"))?;

    match verb.as_str() {
        "Launch" => Ok(Action::Launch {
            app: take_string(&args, "app").ok_or(ParseError::MissingParameter("app"))?,
        }),
        "Tap" => Ok(Action::Tap {
            point: take_point(&args, "element")?,
            sensitive_message: take_string(&args, "message"),
        }),
        "Double Tap" | "DoubleTap" => Ok(Action::DoubleTap {
            point: take_point(&args, "element")?,
        }),
        "Long Press" | "LongPress" => Ok(Action::LongPress {
            point: take_point(&args, "element")?,
        }),
        "Swipe" => Ok(Action::Swipe {
            start: take_point(&args, "start")?,
            end: take_point(&args, "end")?,
        }),
        "Type" => Ok(Action::Type {
            text: take_string(&args, "text").ok_or(ParseError::MissingParameter("text"))?,
        }),
        "Back" => Ok(Action::Back),
        "Home" => Ok(Action::Home),
        "Wait" => Ok(Action::Wait {
            duration: take_duration(&args, "duration"),
        }),
        "Take_over" | "TakeOver" | "Take Over" => Ok(Action::TakeOver {
            message: take_string(&args, "message")
                .unwrap_or_else(|| "manual operation required".to_string()),
        }),
        other => Err(ParseError::UnknownVerb(other.to_string())),
    }
}

fn take_string(args: &HashMap<String, Arg>, key: &str) -> Option<String> {
    match args.get(key) {
        Some(Arg::Str(s)) => Some(s.clone()),
        Some(Arg::Num(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn take_point(args: &HashMap<String, Arg>, key: &'static str) -> Result<RelPoint, ParseError> {
    match args.get(key) {
        Some(Arg::List(items)) if items.len() >= 2 => Ok(RelPoint::new(items[0], items[1])),
        Some(Arg::List(items)) => Err(ParseError::InvalidParameter {
            name: key,
            detail: format!("expected two integers, got {}", items.len()),
        }),
        Some(_) => Err(ParseError::InvalidParameter {
            name: key,
            detail: "expected a [x, y] list".to_string(),
        }),
        None => Err(ParseError::MissingParameter(key)),
    }
}

/// Parse `duration="N seconds"` (or a bare number). Unparseable input falls
/// back to one second, matching the model's loose phrasing in the wild.
fn take_duration(args: &HashMap<String, Arg>, key: &str) -> Duration {
    let secs = match args.get(key) {
        Some(Arg::Num(n)) => *n,
        Some(Arg::Str(s)) => {
            let numeric: String = s
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            numeric.parse::<f64>().unwrap_or(1.0)
        }
        _ => 1.0,
    };
    Duration::from_secs_f64(secs.max(0.0))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
