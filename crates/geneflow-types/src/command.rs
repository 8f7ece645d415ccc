//! Execution-method and command-block definitions.
//!
//! An app lists one or more [`ExecMethod`]s, each guarded by a predicate
//! tree. The selected method's [`CommandBlock`]s describe what to run:
//! single commands (optionally inside a container), pipes, and independent
//! multi-command groups, any of which may be conditional.
//!
//! ```yaml
//! exec_methods:
//!   - name: singularity
//!     if:
//!       - in_path: singularity
//!     exec:
//!       - type: singularity
//!         image: docker://biocontainers/bwa:0.7.17
//!         run: bwa index
//!         args:
//!           - flag: -p
//!             value: ${output}/index
//!           - mount: ${reference}
//! ```

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exec methods
// ---------------------------------------------------------------------------

/// A named, conditionally-available strategy for running an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecMethod {
    pub name: String,
    /// Conditions that must all hold for the method to be selectable.
    /// An empty list always holds.
    #[serde(rename = "if", default, skip_serializing_if = "Vec::is_empty")]
    pub condition: Vec<Predicate>,
    /// Blocks executed in order when the method is selected.
    #[serde(default)]
    pub exec: Vec<CommandBlock>,
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A node in a predicate tree.
///
/// Combinators nest arbitrarily; leaf tests operate on operands after
/// `${name}` variables have been substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    #[serde(rename = "none")]
    NoneOf(Vec<Predicate>),

    Defined(String),
    NotDefined(String),

    StrEqual(Operand, Operand),
    NotStrEqual(Operand, Operand),
    StrContain(Operand, Operand),
    NotStrContain(Operand, Operand),

    Equal(Operand, Operand),
    NotEqual(Operand, Operand),
    Less(Operand, Operand),
    Greater(Operand, Operand),
    LessEqual(Operand, Operand),
    GreaterEqual(Operand, Operand),

    FileExist(Operand),
    NotFileExist(Operand),
    DirExist(Operand),
    NotDirExist(Operand),
    Exist(Operand),
    NotExist(Operand),
    InPath(Operand),
}

/// A predicate operand. YAML numbers and booleans are accepted and kept in
/// their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OperandRepr", into = "String")]
pub struct Operand(pub String);

impl Operand {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<Operand> for String {
    fn from(value: Operand) -> Self {
        value.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OperandRepr {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<OperandRepr> for Operand {
    fn from(value: OperandRepr) -> Self {
        match value {
            OperandRepr::Text(s) => Self(s),
            OperandRepr::Integer(i) => Self(i.to_string()),
            OperandRepr::Float(f) => Self(f.to_string()),
            OperandRepr::Bool(b) => Self(b.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Command blocks
// ---------------------------------------------------------------------------

/// One command-block node, optionally guarded by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommandBlock", into = "RawCommandBlock")]
pub struct CommandBlock {
    pub condition: Option<Conditional>,
    pub kind: CommandKind,
}

/// `if` predicates plus the optional `else` blocks run when they fail.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub test: Vec<Predicate>,
    pub otherwise: Vec<CommandBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Simple(SimpleCommand),
    /// Stdout of each item feeds stdin of the next.
    Pipe(Vec<CommandBlock>),
    /// Items run independently, in listed order.
    Multi(Vec<CommandBlock>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleCommand {
    pub runtime: Runtime,
    pub run: String,
    pub image: Option<String>,
    pub args: Vec<CommandArg>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Where a simple command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    #[default]
    Shell,
    Singularity,
    Docker,
}

impl Runtime {
    pub fn is_container(self) -> bool {
        !matches!(self, Runtime::Shell)
    }
}

/// A command-line argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    Literal(String),
    Option {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        /// Path bound into container runtimes; used as the argument value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawCommandBlock {
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    condition: Option<Vec<Predicate>>,
    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    otherwise: Vec<CommandBlock>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    runtime: Option<Runtime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<CommandArg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipe: Option<Vec<CommandBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multi: Option<Vec<CommandBlock>>,
}

impl TryFrom<RawCommandBlock> for CommandBlock {
    type Error = String;

    fn try_from(raw: RawCommandBlock) -> Result<Self, Self::Error> {
        if raw.condition.is_none() && !raw.otherwise.is_empty() {
            return Err("'else' requires 'if'".to_string());
        }
        let kind = match (raw.run, raw.pipe, raw.multi) {
            (Some(run), None, None) => {
                let runtime = raw.runtime.unwrap_or_default();
                if runtime.is_container() && raw.image.is_none() {
                    return Err(format!("container command '{run}' requires an image"));
                }
                CommandKind::Simple(SimpleCommand {
                    runtime,
                    run,
                    image: raw.image,
                    args: raw.args,
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                })
            }
            (None, Some(items), None) => CommandKind::Pipe(items),
            (None, None, Some(items)) => CommandKind::Multi(items),
            (None, None, None) => {
                return Err("command block needs one of 'run', 'pipe', or 'multi'".to_string());
            }
            _ => {
                return Err(
                    "command block may set only one of 'run', 'pipe', or 'multi'".to_string(),
                );
            }
        };

        let condition = raw.condition.map(|test| Conditional {
            test,
            otherwise: raw.otherwise,
        });

        Ok(Self { condition, kind })
    }
}

impl From<CommandBlock> for RawCommandBlock {
    fn from(block: CommandBlock) -> Self {
        let mut raw = RawCommandBlock::default();
        if let Some(cond) = block.condition {
            raw.condition = Some(cond.test);
            raw.otherwise = cond.otherwise;
        }
        match block.kind {
            CommandKind::Simple(cmd) => {
                raw.runtime = cmd.runtime.is_container().then_some(cmd.runtime);
                raw.run = Some(cmd.run);
                raw.image = cmd.image;
                raw.args = cmd.args;
                raw.stdout = cmd.stdout;
                raw.stderr = cmd.stderr;
            }
            CommandKind::Pipe(items) => raw.pipe = Some(items),
            CommandKind::Multi(items) => raw.multi = Some(items),
        }
        raw
    }
}
