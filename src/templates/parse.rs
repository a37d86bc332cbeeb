//! Template parse tree

use super::TemplateError;
use super::lex::{Item, Token, lex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        condition: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// Commands joined by `|`; each command's result is the last argument of the next
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    pub line: usize,
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<Arg>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Field(Vec<String>),
    Dot,
    /// `$` followed by a possibly empty field chain
    Root(Vec<String>),
    Function(String),
    Str(String),
    RawStr(String),
    Int(i64),
    Bool(bool),
    Nil,
    Pipeline(Box<Pipeline>),
}

impl Arg {
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Arg::Str(s) | Arg::RawStr(s) => Some(s),
            _ => None,
        }
    }
}

/// A parsed template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn parse(name: &str, input: &str) -> Result<Tree, TemplateError> {
        let items = lex(name, input)?;
        let mut parser = Parser {
            name,
            items,
            pos: 0,
        };
        let (nodes, end) = parser.list()?;
        if let Some(end) = end {
            return Err(parser.error(end.line, &format!("unexpected {{{{{}}}}}", end.keyword)));
        }
        Ok(Tree {
            name: name.to_string(),
            nodes,
        })
    }

    /// Every command in the tree, depth first
    pub fn commands(&self) -> Vec<&Command> {
        let mut out = Vec::new();
        collect_nodes(&self.nodes, &mut out);
        out
    }
}

fn collect_nodes<'a>(nodes: &'a [Node], out: &mut Vec<&'a Command>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(p) => collect_pipeline(p, out),
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                collect_pipeline(condition, out);
                collect_nodes(then, out);
                collect_nodes(otherwise, out);
            }
            Node::Range {
                pipeline,
                body,
                otherwise,
            }
            | Node::With {
                pipeline,
                body,
                otherwise,
            } => {
                collect_pipeline(pipeline, out);
                collect_nodes(body, out);
                collect_nodes(otherwise, out);
            }
        }
    }
}

fn collect_pipeline<'a>(pipeline: &'a Pipeline, out: &mut Vec<&'a Command>) {
    for command in &pipeline.commands {
        out.push(command);
        for arg in &command.args {
            if let Arg::Pipeline(inner) = arg {
                collect_pipeline(inner, out);
            }
        }
    }
}

/// Keyword action that closed a list: `end`, `else` or `else if ...`
struct ListEnd {
    keyword: String,
    line: usize,
    /// Tokens following `else`, for `else if`/`else with`
    rest: Vec<Token>,
}

struct Parser<'a> {
    name: &'a str,
    items: Vec<Item>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, line: usize, message: &str) -> TemplateError {
        TemplateError::Parse {
            name: self.name.to_string(),
            line,
            message: message.to_string(),
        }
    }

    /// Parse nodes until `end`, `else` or end of input
    fn list(&mut self) -> Result<(Vec<Node>, Option<ListEnd>), TemplateError> {
        let mut nodes = Vec::new();
        while self.pos < self.items.len() {
            let item = self.items[self.pos].clone();
            self.pos += 1;
            match item {
                Item::Text(text) => nodes.push(Node::Text(text)),
                Item::Action { tokens, line } => {
                    let keyword = match tokens.first() {
                        Some(Token::Ident(k)) => k.as_str(),
                        _ => "",
                    };
                    match keyword {
                        "end" | "else" => {
                            return Ok((
                                nodes,
                                Some(ListEnd {
                                    keyword: keyword.to_string(),
                                    line,
                                    rest: tokens[1..].to_vec(),
                                }),
                            ));
                        }
                        "if" | "range" | "with" => {
                            let kw = keyword.to_string();
                            nodes.push(self.control(&kw, &tokens[1..], line)?);
                        }
                        "define" | "template" | "block" | "break" | "continue" => {
                            return Err(self.error(line, &format!("{} is not supported", keyword)));
                        }
                        _ => nodes.push(Node::Action(self.pipeline(&tokens, line)?)),
                    }
                }
            }
        }
        Ok((nodes, None))
    }

    fn control(&mut self, keyword: &str, tokens: &[Token], line: usize) -> Result<Node, TemplateError> {
        let pipeline = self.pipeline(tokens, line)?;
        let (body, end) = self.list()?;
        let end = end.ok_or_else(|| self.error(line, &format!("unexpected EOF in {}", keyword)))?;

        let otherwise = match end.keyword.as_str() {
            "end" => {
                if !end.rest.is_empty() {
                    return Err(self.error(end.line, "unexpected tokens after end"));
                }
                Vec::new()
            }
            _ => match end.rest.first() {
                // `else if` and `else with` chain: the nested node consumes the shared end
                Some(Token::Ident(k)) if k == keyword && (k == "if" || k == "with") => {
                    vec![self.control(keyword, &end.rest[1..], end.line)?]
                }
                Some(_) => return Err(self.error(end.line, "unexpected tokens after else")),
                None => {
                    let (otherwise, close) = self.list()?;
                    match close {
                        Some(c) if c.keyword == "end" && c.rest.is_empty() => otherwise,
                        Some(c) => {
                            return Err(self.error(c.line, &format!("expected end; found {}", c.keyword)));
                        }
                        None => {
                            return Err(self.error(line, &format!("unexpected EOF in {}", keyword)));
                        }
                    }
                }
            },
        };

        Ok(match keyword {
            "if" => Node::If {
                condition: pipeline,
                then: body,
                otherwise,
            },
            "range" => Node::Range {
                pipeline,
                body,
                otherwise,
            },
            _ => Node::With {
                pipeline,
                body,
                otherwise,
            },
        })
    }

    fn pipeline(&self, tokens: &[Token], line: usize) -> Result<Pipeline, TemplateError> {
        let mut pos = 0;
        let pipeline = self.pipeline_at(tokens, &mut pos, line)?;
        if pos < tokens.len() {
            return Err(self.error(line, &format!("unexpected {:?} in operand", tokens[pos])));
        }
        Ok(pipeline)
    }

    /// Parse commands until end of tokens or an unmatched `)`
    fn pipeline_at(&self, tokens: &[Token], pos: &mut usize, line: usize) -> Result<Pipeline, TemplateError> {
        let mut commands = Vec::new();
        let mut args = Vec::new();

        while *pos < tokens.len() {
            let token = &tokens[*pos];
            *pos += 1;
            let arg = match token {
                Token::Pipe => {
                    if args.is_empty() {
                        return Err(self.error(line, "missing command before |"));
                    }
                    commands.push(Command {
                        args: std::mem::take(&mut args),
                    });
                    continue;
                }
                Token::RightParen => {
                    *pos -= 1;
                    break;
                }
                Token::LeftParen => {
                    let inner = self.pipeline_at(tokens, pos, line)?;
                    if tokens.get(*pos) != Some(&Token::RightParen) {
                        return Err(self.error(line, "unclosed left paren"));
                    }
                    *pos += 1;
                    if inner.commands.is_empty() {
                        return Err(self.error(line, "missing value for parenthesized pipeline"));
                    }
                    Arg::Pipeline(Box::new(inner))
                }
                Token::Field(f) => Arg::Field(f.clone()),
                Token::Dot => Arg::Dot,
                Token::Variable(f) => Arg::Root(f.clone()),
                Token::Ident(name) => Arg::Function(name.clone()),
                Token::Str(s) => Arg::Str(s.clone()),
                Token::RawStr(s) => Arg::RawStr(s.clone()),
                Token::Int(i) => Arg::Int(*i),
                Token::Bool(b) => Arg::Bool(*b),
                Token::Nil => Arg::Nil,
            };
            args.push(arg);
        }

        if args.is_empty() {
            if !commands.is_empty() {
                return Err(self.error(line, "missing command after |"));
            }
        } else {
            commands.push(Command { args });
        }
        if commands.is_empty() {
            return Err(self.error(line, "missing value for command"));
        }
        Ok(Pipeline { line, commands })
    }
}
