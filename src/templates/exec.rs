//! Template evaluation
//!
//! Evaluation is synchronous. Anything that needs I/O, such as `Query`,
//! is resolved by the data source before execution starts.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use super::TemplateError;
use super::parse::{Arg, Command, Node, Pipeline, Tree};

/// A value flowing through a template
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i64::from(i))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("<no value>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("map[")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Root object of a template
///
/// `.Name` resolves through [`DataSource::field`], `.Name arg...` through
/// [`DataSource::method`].
pub trait DataSource {
    fn field(&self, name: &str) -> Result<Value, String>;

    fn method(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        let _ = args;
        Err(format!("can't give argument to non-function .{}", name))
    }
}

/// A data source backed by a map, used for configuration files
#[derive(Clone, Debug, Default)]
pub struct MapSource(pub BTreeMap<String, Value>);

impl DataSource for MapSource {
    fn field(&self, name: &str) -> Result<Value, String> {
        Ok(self.0.get(name).cloned().unwrap_or(Value::Nil))
    }
}

/// Current value of `.`
#[derive(Clone)]
enum Dot {
    Root,
    Value(Value),
}

struct State<'a> {
    name: &'a str,
    source: &'a dyn DataSource,
    out: String,
}

impl Tree {
    pub fn execute(&self, source: &dyn DataSource) -> Result<String, TemplateError> {
        let mut state = State {
            name: &self.name,
            source,
            out: String::new(),
        };
        state.walk(&Dot::Root, &self.nodes)?;
        Ok(state.out)
    }
}

impl State<'_> {
    fn error(&self, line: usize, message: impl fmt::Display) -> TemplateError {
        TemplateError::Exec {
            name: self.name.to_string(),
            line,
            message: message.to_string(),
        }
    }

    fn walk(&mut self, dot: &Dot, nodes: &[Node]) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::Action(pipeline) => {
                    let value = self.pipeline(dot, pipeline)?;
                    self.out.push_str(&value.to_string());
                }
                Node::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    if self.pipeline(dot, condition)?.is_truthy() {
                        self.walk(dot, then)?;
                    } else {
                        self.walk(dot, otherwise)?;
                    }
                }
                Node::With {
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let value = self.pipeline(dot, pipeline)?;
                    if value.is_truthy() {
                        self.walk(&Dot::Value(value), body)?;
                    } else {
                        self.walk(dot, otherwise)?;
                    }
                }
                Node::Range {
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let items = match self.pipeline(dot, pipeline)? {
                        Value::List(items) => items,
                        Value::Map(map) => map.into_values().collect(),
                        Value::Nil => Vec::new(),
                        Value::Int(n) => (0..n.max(0)).map(Value::Int).collect(),
                        other => {
                            return Err(self.error(
                                pipeline.line,
                                format!("range can't iterate over {}", other.type_name()),
                            ));
                        }
                    };
                    if items.is_empty() {
                        self.walk(dot, otherwise)?;
                    }
                    for item in items {
                        self.walk(&Dot::Value(item), body)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn pipeline(&self, dot: &Dot, pipeline: &Pipeline) -> Result<Value, TemplateError> {
        let mut previous: Option<Value> = None;
        for command in &pipeline.commands {
            previous = Some(self.command(dot, command, previous, pipeline.line)?);
        }
        Ok(previous.unwrap_or(Value::Nil))
    }

    fn command(
        &self,
        dot: &Dot,
        command: &Command,
        piped: Option<Value>,
        line: usize,
    ) -> Result<Value, TemplateError> {
        let Some((head, rest)) = command.args.split_first() else {
            return Err(self.error(line, "empty command"));
        };

        let mut args = Vec::with_capacity(rest.len() + 1);
        for arg in rest {
            args.push(self.operand(dot, arg, line)?);
        }
        args.extend(piped);

        match head {
            Arg::Function(name) => call_builtin(name, &args).map_err(|e| self.error(line, e)),
            Arg::Field(chain) => self.field_chain(dot, chain, &args, line),
            Arg::Root(chain) if !chain.is_empty() => self.field_chain(&Dot::Root, chain, &args, line),
            other => {
                if !args.is_empty() {
                    return Err(self.error(line, format!("can't give argument to non-function {:?}", other)));
                }
                self.operand(dot, other, line)
            }
        }
    }

    fn operand(&self, dot: &Dot, arg: &Arg, line: usize) -> Result<Value, TemplateError> {
        match arg {
            Arg::Field(chain) => self.field_chain(dot, chain, &[], line),
            Arg::Root(chain) => self.field_chain(&Dot::Root, chain, &[], line),
            Arg::Dot => match dot {
                Dot::Root => Err(self.error(line, "the root data source can't be used as a value")),
                Dot::Value(v) => Ok(v.clone()),
            },
            Arg::Function(name) => call_builtin(name, &[]).map_err(|e| self.error(line, e)),
            Arg::Str(s) | Arg::RawStr(s) => Ok(Value::Str(s.clone())),
            Arg::Int(i) => Ok(Value::Int(*i)),
            Arg::Bool(b) => Ok(Value::Bool(*b)),
            Arg::Nil => Ok(Value::Nil),
            Arg::Pipeline(p) => self.pipeline(dot, p),
        }
    }

    /// Resolve `.A.B.C`; arguments apply to the last element
    fn field_chain(
        &self,
        dot: &Dot,
        chain: &[String],
        args: &[Value],
        line: usize,
    ) -> Result<Value, TemplateError> {
        let Some((first, rest)) = chain.split_first() else {
            return match dot {
                Dot::Root => Err(self.error(line, "the root data source can't be used as a value")),
                Dot::Value(v) => Ok(v.clone()),
            };
        };

        let first_args = if rest.is_empty() { args } else { &[] };
        let mut value = match dot {
            Dot::Root if first_args.is_empty() => self.source.field(first),
            Dot::Root => self.source.method(first, first_args),
            Dot::Value(v) => {
                if !first_args.is_empty() {
                    return Err(self.error(line, format!("can't give argument to non-function .{}", first)));
                }
                lookup(v, first)
            }
        }
        .map_err(|e| self.error(line, e))?;

        for (i, name) in rest.iter().enumerate() {
            if i + 1 == rest.len() && !args.is_empty() {
                return Err(self.error(line, format!("can't give argument to non-function .{}", name)));
            }
            value = lookup(&value, name).map_err(|e| self.error(line, e))?;
        }
        Ok(value)
    }
}

fn lookup(value: &Value, name: &str) -> Result<Value, String> {
    match value {
        Value::Map(map) => Ok(map.get(name).cloned().unwrap_or(Value::Nil)),
        Value::Nil => Err(format!("nil pointer evaluating .{}", name)),
        other => Err(format!("can't evaluate field {} in type {}", name, other.type_name())),
    }
}

/// Names of the functions callable from templates
pub const BUILTINS: [&str; 14] = [
    "and", "eq", "ge", "gt", "index", "le", "len", "lt", "ne", "not", "or", "print", "printf",
    "split",
];

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "and" => {
            let first_falsy = args.iter().find(|a| !a.is_truthy());
            first_falsy
                .or(args.last())
                .cloned()
                .ok_or_else(|| "wrong number of args for and: want at least 1 got 0".to_string())
        }
        "or" => {
            let first_truthy = args.iter().find(|a| a.is_truthy());
            first_truthy
                .or(args.last())
                .cloned()
                .ok_or_else(|| "wrong number of args for or: want at least 1 got 0".to_string())
        }
        "not" => {
            let [value] = args else {
                return Err(arity("not", 1, args.len()));
            };
            Ok(Value::Bool(!value.is_truthy()))
        }
        "eq" => {
            let Some((first, others)) = args.split_first() else {
                return Err(arity("eq", 2, args.len()));
            };
            if others.is_empty() {
                return Err("missing argument for comparison".to_string());
            }
            for other in others {
                if compare(first, other)? == Ordering::Equal {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "ne" | "lt" | "le" | "gt" | "ge" => {
            let [a, b] = args else {
                return Err(arity(name, 2, args.len()));
            };
            let ordering = compare(a, b)?;
            Ok(Value::Bool(match name {
                "ne" => ordering != Ordering::Equal,
                "lt" => ordering == Ordering::Less,
                "le" => ordering != Ordering::Greater,
                "gt" => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        "len" => {
            let [value] = args else {
                return Err(arity("len", 1, args.len()));
            };
            let len = match value {
                Value::Str(s) => s.len(),
                Value::List(l) => l.len(),
                Value::Map(m) => m.len(),
                other => return Err(format!("len of type {}", other.type_name())),
            };
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        "index" => {
            let Some((first, keys)) = args.split_first() else {
                return Err(arity("index", 1, 0));
            };
            let mut value = first.clone();
            for key in keys {
                value = match (&value, key) {
                    (Value::List(items), Value::Int(i)) => usize::try_from(*i)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .ok_or_else(|| format!("index out of range: {}", i))?,
                    (Value::Map(map), Value::Str(k)) => map.get(k).cloned().unwrap_or(Value::Nil),
                    (v, k) => {
                        return Err(format!("can't index item of type {} with {}", v.type_name(), k.type_name()));
                    }
                };
            }
            Ok(value)
        }
        "print" => Ok(Value::Str(sprint(args))),
        "printf" => {
            let Some((Value::Str(format), rest)) = args.split_first() else {
                return Err("printf needs a format string".to_string());
            };
            Ok(Value::Str(sprintf(format, rest)))
        }
        "split" => {
            let [Value::Str(s), Value::Str(sep)] = args else {
                return Err("split needs a string and a separator".to_string());
            };
            Ok(Value::List(s.split(sep.as_str()).map(Value::from).collect()))
        }
        other => Err(format!("function {:?} not defined", other)),
    }
}

fn arity(name: &str, want: usize, got: usize) -> String {
    format!("wrong number of args for {}: want {} got {}", name, want, got)
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (Value::Nil, Value::Nil) => Ok(Ordering::Equal),
        (a, b) => Err(format!(
            "incompatible types for comparison: {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

/// Operands are separated by a space when neither side is a string
fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            let prev_is_str = matches!(args[i - 1], Value::Str(_));
            if !prev_is_str && !matches!(arg, Value::Str(_)) {
                out.push(' ');
            }
        }
        out.push_str(&arg.to_string());
    }
    out
}

/// `%s`, `%d`, `%v`, `%q` and `%%`
fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'd' | 'v' | 'q')) => match args.next() {
                Some(arg) if verb == 'q' => out.push_str(&format!("{:?}", arg.to_string())),
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str(&format!("%!{}(MISSING)", verb)),
            },
            Some(other) => out.push_str(&format!("%!{}(BADVERB)", other)),
            None => out.push_str("%!(NOVERB)"),
        }
    }
    out
}
