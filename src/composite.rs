// Composite-tool executor.
//
// A composite tool is a flat sequence of steps, each naming a
// target tool, a parameter template, and optionally a context
// variable to store the step's result under. Execution seeds a
// per-invocation variable context from the caller's top-level
// parameters, substitutes {{identifier}} references in each step's
// template, and re-enters the registry dispatcher with the built
// invocation.
//
// Error policy is short-circuit: the first non-success step aborts
// the composite and its result is forwarded verbatim, unwrapped.
//
// Re-entry is bounded by an explicit execution frame rather than
// the host stack: a composite may not appear twice in the active
// chain (cycle), and the chain may not exceed MAX_DEPTH.

use std::collections::HashMap;

use regex::{Captures, Regex};
use serde_json::{json, Value as Json};

use crate::tools::{ToolRegistry, ToolResult, ToolStatus};
use crate::value::Value;


pub const MAX_DEPTH: usize = 8;

// Variable context capacity; mirrors the execution-context budget
// callers get per invocation.
const CONTEXT_CAPACITY: usize = 32;


#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub tool: String,
    pub params: String,
    pub store: Option<String>,
}


// The per-invocation chain of active composite names. Threaded
// through every dispatcher re-entry so nested composites share one
// depth budget.
pub struct ExecFrame {
    active: Vec<String>,
}

impl ExecFrame {
    pub fn new() -> ExecFrame {
        ExecFrame { active: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }
}


// Replace every {{identifier}} with the display form of the
// context binding, or the empty string when unbound. Single-brace
// references are not a recognized grammar and pass through
// untouched.
//
// Replacement text is JSON-escaped: templates are JSON documents,
// and a binding that happens to contain quotes (a stored step
// result, say) must not be able to break the document structure.
pub fn substitute(template: &str, context: &HashMap<String, Value>) -> String {
    lazy_static! {
        static ref VAR: Regex = Regex::new(
            r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}"
        ).unwrap();
    }

    VAR.replace_all(template, |caps: &Captures| {
        context
            .get(&caps[1])
            .map(|v| json_escape(&v.to_display_string()))
            .unwrap_or_default()
    }).into_owned()
}


fn json_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            },
            c => out.push(c),
        }
    }
    out
}


pub fn execute(
    registry: &mut ToolRegistry,
    name: &str,
    steps: &[Step],
    params: &Json,
    frame: &mut ExecFrame
) -> ToolResult {
    if frame.active.iter().any(|active| active == name) {
        return ToolResult::error(
            ToolStatus::ExecutionError,
            &format!("composite cycle through '{}'", name)
        );
    }
    if frame.active.len() >= MAX_DEPTH {
        return ToolResult::error(
            ToolStatus::ExecutionError,
            "composite recursion depth exceeded"
        );
    }

    frame.active.push(String::from(name));
    let result = run_steps(registry, steps, params, frame);
    frame.active.pop();
    result
}


fn run_steps(
    registry: &mut ToolRegistry,
    steps: &[Step],
    params: &Json,
    frame: &mut ExecFrame
) -> ToolResult {
    let mut context: HashMap<String, Value> =
        HashMap::with_capacity(CONTEXT_CAPACITY);

    // Seed the context with the caller's top-level fields so
    // templates can reference them directly.
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            context.insert(key.clone(), Value::from_json(value));
        }
    }

    let mut result = ToolResult::success(json!({}));

    for step in steps {
        let substituted = substitute(&step.params, &context);
        let step_params: Json = match serde_json::from_str(&substituted) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ToolResult::error(
                    ToolStatus::ExecutionError,
                    &format!(
                        "step '{}' parameters invalid after substitution: {}",
                        step.tool, e
                    )
                );
            }
        };

        let invocation = json!({"tool": step.tool, "params": step_params});
        result = registry.execute_in_frame(&invocation, frame);

        if !result.is_success() {
            // Forwarded verbatim; the composite does not wrap it.
            return result;
        }

        if let Some(store) = &step.store {
            context.insert(store.clone(), Value::from_json(&result.body));
        }
    }

    result
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value::*;

    fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (String::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn test_substitute_bound() {
        let context = ctx(&[
            ("name", Str(String::from("probe"))),
            ("count", Int(3)),
            ("gain", Float(2.5)),
        ]);
        assert_eq!(
            substitute(r#"{"n":"{{name}}","c":{{count}},"g":{{gain}}}"#, &context),
            r#"{"n":"probe","c":3,"g":2.5}"#
        );
    }

    #[test]
    fn test_substitute_unbound_is_empty() {
        let context = ctx(&[]);
        assert_eq!(substitute("x={{missing}}!", &context), "x=!");
    }

    #[test]
    fn test_substitute_repeated_and_adjacent() {
        let context = ctx(&[("a", Str(String::from("v")))]);
        assert_eq!(substitute("{{a}}{{a}} {{a}}", &context), "vv v");
    }

    #[test]
    fn test_single_brace_not_substituted() {
        let context = ctx(&[("a", Str(String::from("v")))]);
        assert_eq!(substitute("{a}", &context), "{a}");
    }

    #[test]
    fn test_substitute_null_renders_empty() {
        let context = ctx(&[("n", Null)]);
        assert_eq!(substitute("[{{n}}]", &context), "[]");
    }

    #[test]
    fn test_substitute_escapes_quotes() {
        let context = ctx(&[("r", Str(String::from(r#"{"logged":true}"#)))]);
        let out = substitute(r#"{"m":"saw {{r}}"}"#, &context);
        // The result must still parse as JSON.
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["m"], json!(r#"saw {"logged":true}"#));
    }

    // End-to-end composite behavior is covered in tools::tests,
    // where a registry exists to dispatch into.
}
