//! Template lexer
//!
//! Splits a template into text runs and actions. `{{- ` and ` -}}` trim the
//! whitespace of the adjacent text run; `{{/* ... */}}` comments vanish.

use super::TemplateError;

const LEFT_DELIM: &str = "{{";
const RIGHT_DELIM: &str = "}}";
const LEFT_COMMENT: &str = "/*";
const RIGHT_COMMENT: &str = "*/";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// `.A.B.C`
    Field(Vec<String>),
    /// `.`
    Dot,
    /// `$` or `$.A.B`
    Variable(Vec<String>),
    Ident(String),
    /// Double-quoted string, unescaped
    Str(String),
    /// Backtick string
    RawStr(String),
    Int(i64),
    Bool(bool),
    Nil,
    Pipe,
    LeftParen,
    RightParen,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Text(String),
    Action { tokens: Vec<Token>, line: usize },
}

pub fn lex(name: &str, input: &str) -> Result<Vec<Item>, TemplateError> {
    let mut items = Vec::new();
    let mut rest = input;
    let mut line = 1;
    let mut trim_next_text = false;

    while !rest.is_empty() {
        let Some(start) = rest.find(LEFT_DELIM) else {
            push_text(&mut items, rest, trim_next_text, false);
            break;
        };

        let after_delim = &rest[start + LEFT_DELIM.len()..];
        let trim_left = after_delim.starts_with("- ")
            || after_delim.starts_with("-\t")
            || after_delim.starts_with("-\n");
        push_text(&mut items, &rest[..start], trim_next_text, trim_left);
        line += rest[..start].matches('\n').count();

        let body_start = if trim_left { 2 } else { 0 };
        let body = &after_delim[body_start..];

        let Some(end) = body.find(RIGHT_DELIM) else {
            return Err(parse_error(name, line, "unclosed action"));
        };
        let mut action = &body[..end];
        trim_next_text = action.ends_with(" -") || action.ends_with("\t-") || action.ends_with("\n-");
        if trim_next_text {
            action = &action[..action.len() - 2];
        }

        let trimmed = action.trim();
        if trimmed.starts_with(LEFT_COMMENT) {
            if !trimmed.ends_with(RIGHT_COMMENT) {
                return Err(parse_error(name, line, "unclosed comment"));
            }
        } else {
            let tokens = tokenize(action).map_err(|m| parse_error(name, line, &m))?;
            if tokens.is_empty() {
                return Err(parse_error(name, line, "missing value for command"));
            }
            items.push(Item::Action { tokens, line });
        }

        line += body[..end].matches('\n').count();
        rest = &body[end + RIGHT_DELIM.len()..];
    }

    Ok(items)
}

fn push_text(items: &mut Vec<Item>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        items.push(Item::Text(text.to_string()));
    }
}

fn parse_error(name: &str, line: usize, message: &str) -> TemplateError {
    TemplateError::Parse {
        name: name.to_string(),
        line,
        message: message.to_string(),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(action: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = action.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            '.' => {
                let (fields, next) = field_chain(&chars, i);
                tokens.push(if fields.is_empty() {
                    Token::Dot
                } else {
                    Token::Field(fields)
                });
                i = next;
            }
            '$' => {
                let start = i + 1;
                if chars.get(start).is_some_and(|c| is_ident_char(*c)) {
                    return Err("variables other than $ are not supported".to_string());
                }
                let (fields, next) = field_chain(&chars, start);
                tokens.push(Token::Variable(fields));
                i = next;
            }
            '"' => {
                let (value, next) = quoted(&chars, i)?;
                tokens.push(Token::Str(value));
                i = next;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '`')
                    .ok_or_else(|| "unterminated raw quoted string".to_string())?;
                tokens.push(Token::RawStr(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| format!("bad number syntax: {:?}", text))?;
                tokens.push(Token::Int(value));
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "nil" => Token::Nil,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected {:?} in command", other)),
        }
    }

    Ok(tokens)
}

/// Read `.A.B` starting at a `.`; returns the names and the index after them
fn field_chain(chars: &[char], mut i: usize) -> (Vec<String>, usize) {
    let mut fields = Vec::new();
    while chars.get(i) == Some(&'.') {
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
        if end == start {
            // A bare dot ends the chain
            if fields.is_empty() {
                i = start;
            }
            break;
        }
        fields.push(chars[start..end].iter().collect());
        i = end;
    }
    (fields, i)
}

fn quoted(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((value, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "unterminated quoted string".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => return Err(format!("unknown escape sequence \\{}", other)),
                });
                i += 2;
            }
            '\n' => return Err("unterminated quoted string".to_string()),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated quoted string".to_string())
}
