//! Admission checks for template bodies

use std::sync::LazyLock;

use regex::Regex;

use super::exec::BUILTINS;
use super::parse::{Arg, Command, Node, Pipeline, Tree};
use super::source::{FIELDS, METHODS};

#[allow(clippy::expect_used)]
static ACTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{.*?\}\}").expect("action regex"));

#[allow(clippy::expect_used)]
static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*\.\w+\s*\}\}$").expect("placeholder regex"));

/// Check a `templates` body: it must parse and may only reach the allowed
/// fields, methods and functions
pub fn validate_template(name: &str, body: &str) -> Result<(), String> {
    let tree = Tree::parse(name, body).map_err(|e| e.to_string())?;
    check_nodes(&tree.nodes, true)
}

/// Check a legacy `secretsTemplates` body: every action must be a single
/// `{{ .Field }}` placeholder
pub fn validate_legacy_template(name: &str, body: &str) -> Result<(), String> {
    for action in ACTION_REGEX.find_iter(body) {
        if !PLACEHOLDER_REGEX.is_match(action.as_str()) {
            return Err(format!(
                "{}: {} is not a valid placeholder, only {{{{ .Field }}}} is allowed",
                name,
                action.as_str()
            ));
        }
    }
    Ok(())
}

/// `at_root` is false inside `range` and `with`, where `.` is rebound
fn check_nodes(nodes: &[Node], at_root: bool) -> Result<(), String> {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(p) => check_pipeline(p, at_root)?,
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                check_pipeline(condition, at_root)?;
                check_nodes(then, at_root)?;
                check_nodes(otherwise, at_root)?;
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
                check_pipeline(pipeline, at_root)?;
                check_nodes(body, false)?;
                check_nodes(otherwise, at_root)?;
            }
        }
    }
    Ok(())
}

fn check_pipeline(pipeline: &Pipeline, at_root: bool) -> Result<(), String> {
    for command in &pipeline.commands {
        check_command(command, at_root)?;
    }
    Ok(())
}

fn check_command(command: &Command, at_root: bool) -> Result<(), String> {
    for (i, arg) in command.args.iter().enumerate() {
        let root_chain = match arg {
            Arg::Field(chain) if at_root => Some(chain),
            Arg::Root(chain) => Some(chain),
            _ => None,
        };
        if let Some(head) = root_chain.and_then(|chain| chain.first()) {
            if METHODS.contains(&head.as_str()) {
                let well_formed = i == 0
                    && matches!(command.args.as_slice(), [_, Arg::Str(_)]);
                if !well_formed {
                    return Err(format!("{} must be called with one double-quoted argument", head));
                }
            } else if !FIELDS.contains(&head.as_str()) {
                return Err(format!(
                    "field {} is not allowed, use one of: {}, {}",
                    head,
                    FIELDS.join(", "),
                    METHODS.join(", ")
                ));
            }
        }

        match arg {
            Arg::Function(name) if !BUILTINS.contains(&name.as_str()) => {
                return Err(format!("function {} is not allowed", name));
            }
            Arg::Pipeline(inner) => check_pipeline(inner, at_root)?,
            _ => {}
        }
    }
    Ok(())
}
