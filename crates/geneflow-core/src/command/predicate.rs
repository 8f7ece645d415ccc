//! Predicate interpreter and `${name}` variable substitution.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use geneflow_types::command::{Operand, Predicate};
use geneflow_types::error::ResolutionError;
use regex::Regex;

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
});

/// Command variables for one invocation. Only defined (non-empty) values
/// are present.
pub type Vars = BTreeMap<String, String>;

/// Host facts that exec-method and command-block conditions can test.
pub trait EnvironmentProbe: Send + Sync {
    /// Whether `program` resolves to an executable on the search path.
    fn in_path(&self, program: &str) -> bool;

    fn file_exists(&self, path: &str) -> bool;

    fn dir_exists(&self, path: &str) -> bool;
}

/// Replace every `${name}` in `text` with its value from `vars`.
pub fn substitute(text: &str, vars: &Vars) -> Result<String, ResolutionError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in VARIABLE_RE.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars
            .get(name.as_str())
            .ok_or_else(|| ResolutionError::UndefinedVariable(name.as_str().to_string()))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// True when every predicate holds. An empty list holds.
pub fn evaluate_all(predicates: &[Predicate], vars: &Vars, probe: &dyn EnvironmentProbe) -> bool {
    predicates.iter().all(|p| evaluate(p, vars, probe))
}

/// Evaluate one predicate tree.
///
/// A leaf whose operand references an undefined variable is false, as is a
/// numeric comparison on non-numeric operands.
pub fn evaluate(predicate: &Predicate, vars: &Vars, probe: &dyn EnvironmentProbe) -> bool {
    let text = |op: &Operand| substitute(op.as_str(), vars).ok();
    let pair = |a: &Operand, b: &Operand| text(a).zip(text(b));
    let numbers = |a: &Operand, b: &Operand| {
        let (a, b) = pair(a, b)?;
        Some((a.trim().parse::<f64>().ok()?, b.trim().parse::<f64>().ok()?))
    };
    let exists = |p: &str| probe.file_exists(p) || probe.dir_exists(p);

    match predicate {
        Predicate::All(children) => children.iter().all(|c| evaluate(c, vars, probe)),
        Predicate::Any(children) => children.iter().any(|c| evaluate(c, vars, probe)),
        Predicate::NoneOf(children) => !children.iter().any(|c| evaluate(c, vars, probe)),

        Predicate::Defined(name) => vars.contains_key(variable_name(name)),
        Predicate::NotDefined(name) => !vars.contains_key(variable_name(name)),

        Predicate::StrEqual(a, b) => pair(a, b).is_some_and(|(a, b)| a == b),
        Predicate::NotStrEqual(a, b) => pair(a, b).is_some_and(|(a, b)| a != b),
        Predicate::StrContain(a, b) => pair(a, b).is_some_and(|(a, b)| a.contains(&b)),
        Predicate::NotStrContain(a, b) => pair(a, b).is_some_and(|(a, b)| !a.contains(&b)),

        Predicate::Equal(a, b) => numbers(a, b).is_some_and(|(a, b)| a == b),
        Predicate::NotEqual(a, b) => numbers(a, b).is_some_and(|(a, b)| a != b),
        Predicate::Less(a, b) => numbers(a, b).is_some_and(|(a, b)| a < b),
        Predicate::Greater(a, b) => numbers(a, b).is_some_and(|(a, b)| a > b),
        Predicate::LessEqual(a, b) => numbers(a, b).is_some_and(|(a, b)| a <= b),
        Predicate::GreaterEqual(a, b) => numbers(a, b).is_some_and(|(a, b)| a >= b),

        Predicate::FileExist(p) => text(p).is_some_and(|p| probe.file_exists(&p)),
        Predicate::NotFileExist(p) => text(p).is_some_and(|p| !probe.file_exists(&p)),
        Predicate::DirExist(p) => text(p).is_some_and(|p| probe.dir_exists(&p)),
        Predicate::NotDirExist(p) => text(p).is_some_and(|p| !probe.dir_exists(&p)),
        Predicate::Exist(p) => text(p).is_some_and(|p| exists(&p)),
        Predicate::NotExist(p) => text(p).is_some_and(|p| !exists(&p)),
        Predicate::InPath(p) => text(p).is_some_and(|p| probe.in_path(&p)),
    }
}

/// `defined` accepts either `name` or `${name}`.
fn variable_name(raw: &str) -> &str {
    raw.strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(raw)
}
