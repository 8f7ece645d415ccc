//! Template resolution and map expansion.
//!
//! Step templates reference three kinds of placeholder:
//!
//! - `{workflow->x}`: a workflow input (its locator) or parameter (literal).
//! - `{step->output}`: the base output location of a completed dependency.
//! - `{N}`: the N-th regex capture (1-indexed) of the current map item.
//!
//! Every placeholder must resolve; an unresolvable one is an error rather
//! than a literal pass-through. Other brace text (e.g. `{a,b}`) is left
//! untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use geneflow_types::definition::{StepDefinition, value_to_string};
use geneflow_types::error::ResolutionError;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::data::DataManager;
use crate::locator::Locator;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(?:([^{}]+)->([^{}]+)|(\d+))\}").expect("placeholder pattern is valid")
});

/// Filename recorded for the single item of a reduce step.
pub const REDUCE_ITEM: &str = "root";

// ---------------------------------------------------------------------------
// Placeholders
// ---------------------------------------------------------------------------

/// A parsed placeholder occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Workflow(String),
    Step { step: String, var: String },
    Capture(usize),
}

/// All placeholders in `template`, with their raw text, in order.
pub fn placeholders(template: &str) -> Vec<(String, Placeholder)> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| (caps[0].to_string(), classify(&caps)))
        .collect()
}

fn classify(caps: &Captures<'_>) -> Placeholder {
    match (caps.get(1), caps.get(2)) {
        (Some(scope), Some(name)) if scope.as_str() == "workflow" => {
            Placeholder::Workflow(name.as_str().to_string())
        }
        (Some(scope), Some(name)) => Placeholder::Step {
            step: scope.as_str().to_string(),
            var: name.as_str().to_string(),
        },
        // Digit runs too long for usize can never name a valid group.
        _ => Placeholder::Capture(
            caps.get(3)
                .and_then(|n| n.as_str().parse().ok())
                .unwrap_or(usize::MAX),
        ),
    }
}

// ---------------------------------------------------------------------------
// Resolution context
// ---------------------------------------------------------------------------

/// Resolved workflow-level values shared by every step of a job.
#[derive(Debug, Clone, Default)]
pub struct WorkflowValues {
    pub inputs: BTreeMap<String, Locator>,
    pub parameters: BTreeMap<String, Value>,
}

/// One matched entry of a map source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapItem {
    pub filename: String,
    /// Capture groups in order; unmatched optional groups are empty.
    pub captures: Vec<String>,
}

/// Everything a template may reference for one step (and, inside a map
/// expansion, one item).
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    values: Arc<WorkflowValues>,
    dependencies: Arc<BTreeMap<String, Locator>>,
    item: Option<MapItem>,
}

impl ResolutionContext {
    /// A context with no map item. `dependencies` maps each completed
    /// dependency of the step to its output location.
    pub fn new(values: Arc<WorkflowValues>, dependencies: BTreeMap<String, Locator>) -> Self {
        Self {
            values,
            dependencies: Arc::new(dependencies),
            item: None,
        }
    }

    /// The same context, bound to one map item.
    pub fn for_item(&self, item: MapItem) -> Self {
        Self {
            values: Arc::clone(&self.values),
            dependencies: Arc::clone(&self.dependencies),
            item: Some(item),
        }
    }

    pub fn item(&self) -> Option<&MapItem> {
        self.item.as_ref()
    }

    /// The item's filename, or `root` outside a map expansion.
    pub fn filename(&self) -> &str {
        self.item.as_ref().map_or(REDUCE_ITEM, |i| i.filename.as_str())
    }

    pub fn values(&self) -> &WorkflowValues {
        &self.values
    }

    fn lookup(&self, raw: &str, placeholder: &Placeholder) -> Result<String, ResolutionError> {
        match placeholder {
            Placeholder::Workflow(name) => {
                if let Some(input) = self.values.inputs.get(name) {
                    Ok(input.chopped_uri())
                } else if let Some(param) = self.values.parameters.get(name) {
                    Ok(value_to_string(param))
                } else {
                    Err(ResolutionError::UnknownWorkflowValue(name.clone()))
                }
            }
            Placeholder::Step { step, var } => {
                let output =
                    self.dependencies
                        .get(step)
                        .ok_or_else(|| ResolutionError::NotADependency {
                            step: step.clone(),
                            placeholder: raw.to_string(),
                        })?;
                if var != "output" {
                    return Err(ResolutionError::InvalidStepReference(raw.to_string()));
                }
                Ok(output.chopped_uri())
            }
            Placeholder::Capture(index) => {
                let item = self
                    .item
                    .as_ref()
                    .ok_or(ResolutionError::CaptureOutsideMap(*index))?;
                if *index == 0 || *index > item.captures.len() {
                    return Err(ResolutionError::CaptureOutOfRange {
                        index: *index,
                        available: item.captures.len(),
                    });
                }
                Ok(item.captures[index - 1].clone())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Substitute every placeholder in `template`. Substitution is simultaneous:
/// replaced text is never rescanned.
pub fn resolve(template: &str, ctx: &ResolutionContext) -> Result<String, ResolutionError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&ctx.lookup(whole.as_str(), &classify(&caps))?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Resolve a template value. Only strings can carry placeholders.
pub fn resolve_value(value: &Value, ctx: &ResolutionContext) -> Result<String, ResolutionError> {
    match value {
        Value::String(s) => resolve(s, ctx),
        other => Ok(value_to_string(other)),
    }
}

/// Resolve every entry of a step's template for one context.
pub fn resolve_template(
    step: &StepDefinition,
    ctx: &ResolutionContext,
) -> Result<BTreeMap<String, String>, ResolutionError> {
    step.template
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, ctx)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Map expansion
// ---------------------------------------------------------------------------

/// Compile a map regex so that it must match an entry's full name.
pub fn compile_map_regex(pattern: &str) -> Result<Regex, ResolutionError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| ResolutionError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Keep the entries whose full name matches `pattern`, preserving order.
pub fn match_entries(entries: &[String], pattern: &str) -> Result<Vec<MapItem>, ResolutionError> {
    let re = compile_map_regex(pattern)?;
    Ok(entries
        .iter()
        .filter_map(|name| {
            let caps = re.captures(name)?;
            let captures = (1..caps.len())
                .map(|i| caps.get(i).map_or(String::new(), |m| m.as_str().to_string()))
                .collect();
            Some(MapItem {
                filename: name.clone(),
                captures,
            })
        })
        .collect())
}

/// Expand a step into one context per map item, or a single reduce context
/// when the step has no `map`.
///
/// Items follow the source's sorted listing order.
pub async fn expand_map(
    step: &StepDefinition,
    base: &ResolutionContext,
    data: &DataManager,
) -> Result<Vec<ResolutionContext>, ResolutionError> {
    let Some(map) = &step.map else {
        return Ok(vec![base.clone()]);
    };

    let source_uri = resolve(&map.uri, base)?;
    let source = Locator::parse(&source_uri)?;
    let entries = data
        .list(&source)
        .await
        .map_err(|e| ResolutionError::MapSource {
            source_uri: source_uri.clone(),
            reason: e.to_string(),
        })?;
    if entries.is_empty() {
        return Err(ResolutionError::EmptyMapSource(source_uri));
    }

    let items = match_entries(&entries, &map.regex)?;
    if items.is_empty() {
        return Err(ResolutionError::NoMapMatches {
            source_uri,
            pattern: map.regex.clone(),
        });
    }

    tracing::debug!(
        source = %source,
        listed = entries.len(),
        matched = items.len(),
        "expanded map source"
    );
    Ok(items.into_iter().map(|item| base.for_item(item)).collect())
}

/// Reject item sets in which two items resolve to the same output.
/// `items` pairs each item's filename with its resolved `output`.
pub fn check_output_overlap(items: &[(String, String)]) -> Result<(), ResolutionError> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for (filename, output) in items {
        if let Some(first) = seen.insert(output.as_str(), filename.as_str()) {
            return Err(ResolutionError::OverlappingOutput {
                first: first.to_string(),
                second: filename.clone(),
                output: output.clone(),
            });
        }
    }
    Ok(())
}
