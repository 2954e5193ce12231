//! Default input resolver.
//!
//! Config values may reference other blocks and scoped values:
//! `<block.path>`, `<variable.name>`, `<loop.index>`, `<loop.currentItem>`,
//! `<parallel.items>` and so on, plus `{{ENV_VAR}}` for environment
//! variables. A string made of a single reference resolves to the
//! referenced JSON value; references embedded in longer text are
//! interpolated.

use flowcore::{
    Block, BlockError, BlockOutput, BlockScope, ExecutionContext, InputResolver, Workflow,
};
use serde_json::Value;

#[derive(Debug, Default, Clone)]
pub struct ReferenceResolver;

impl ReferenceResolver {
    pub fn new() -> Self {
        Self
    }

    /// Look up one `a.b.c` reference, `None` when the head names nothing
    fn lookup(
        &self,
        reference: &str,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Option<Value> {
        let mut segments = reference.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let root = match head {
            "loop" => {
                let lp = scope.loop_scope.as_ref()?;
                let value = scoped_value(rest.first()?, lp.index, &lp.item, &lp.items)?;
                walk(value, &rest[1..])
            }
            "parallel" => {
                let p = scope.parallel.as_ref()?;
                let value = scoped_value(rest.first()?, p.index, &p.item, &p.items)?;
                walk(value, &rest[1..])
            }
            "variable" => {
                let name = rest.first()?;
                let value = ctx.workflow_variables.get(*name).cloned()?;
                walk(value, &rest[1..])
            }
            _ => {
                let block = find_block(workflow, head)?;
                let instance = scope
                    .parallel
                    .as_ref()
                    .map(|p| (p.parallel_id.as_str(), p.index));
                let id = match (instance, workflow_parallel_of(workflow, &block.id)) {
                    (Some((parallel_id, i)), Some(owner)) if owner == parallel_id => {
                        flowcore::virtual_block_id(&block.id, parallel_id, i)
                    }
                    _ => block.id.clone(),
                };
                match ctx.output(&id) {
                    Some(output) => walk(Value::Object(output.clone()), &rest),
                    None => Value::Null,
                }
            }
        };
        Some(root)
    }

    fn resolve_string(
        &self,
        text: &str,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Value {
        if let Some(reference) = whole_reference(text) {
            if let Some(value) = self.lookup(reference, workflow, ctx, scope) {
                return value;
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let resolved = after.find('>').and_then(|close| {
                let inner = &after[..close];
                if !is_reference(inner) {
                    return None;
                }
                self.lookup(inner, workflow, ctx, scope)
                    .map(|v| (render(&v), close))
            });
            match resolved {
                Some((text, close)) => {
                    out.push_str(&text);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('<');
                    rest = after;
                }
            }
        }
        out.push_str(rest);

        Value::String(interpolate_env(&out, ctx))
    }
}

impl InputResolver for ReferenceResolver {
    fn resolve_inputs(
        &self,
        block: &Block,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Result<BlockOutput, BlockError> {
        block
            .config
            .iter()
            .map(|(key, value)| {
                self.resolve_value(value, workflow, ctx, scope)
                    .map(|v| (key.clone(), v))
            })
            .collect()
    }

    fn resolve_value(
        &self,
        value: &Value,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        scope: &BlockScope,
    ) -> Result<Value, BlockError> {
        Ok(match value {
            Value::String(s) => self.resolve_string(s, workflow, ctx, scope),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value(v, workflow, ctx, scope))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, workflow, ctx, scope)?)))
                    .collect::<Result<_, BlockError>>()?,
            ),
            other => other.clone(),
        })
    }
}

fn scoped_value(
    field: &str,
    index: usize,
    item: &Option<Value>,
    items: &Option<Vec<Value>>,
) -> Option<Value> {
    match field {
        "index" => Some(Value::from(index)),
        "currentItem" => Some(item.clone().unwrap_or(Value::Null)),
        "items" => Some(items.clone().map(Value::Array).unwrap_or(Value::Null)),
        _ => None,
    }
}

fn find_block<'w>(workflow: &'w Workflow, head: &str) -> Option<&'w Block> {
    workflow
        .find_block(head)
        .or_else(|| workflow.blocks.iter().find(|b| normalize_name(b.name()) == head))
}

fn workflow_parallel_of<'w>(workflow: &'w Workflow, block_id: &str) -> Option<&'w str> {
    workflow
        .parallels
        .values()
        .find(|p| p.nodes.iter().any(|n| n == block_id))
        .map(|p| p.id.as_str())
}

/// Block names are referenced lower-case with spaces removed
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_reference(inner: &str) -> bool {
    !inner.is_empty()
        && !inner.starts_with('.')
        && !inner.ends_with('.')
        && inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn whole_reference(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix('<')?.strip_suffix('>')?;
    is_reference(inner).then_some(inner)
}

fn walk(mut value: Value, path: &[&str]) -> Value {
    for segment in path {
        value = match value {
            Value::Object(mut map) => map.remove(*segment).unwrap_or(Value::Null),
            Value::Array(mut items) => match segment.parse::<usize>() {
                Ok(i) if i < items.len() => items.swap_remove(i),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
    }
    value
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn interpolate_env(text: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match ctx.environment_variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..close]);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{BlockState, BlockType, ParallelScope};
    use serde_json::json;

    fn fixture() -> (Workflow, ExecutionContext) {
        let mut wf = Workflow::new("refs");
        wf.add_block(Block::new("start", BlockType::Starter).with_name("Start Here"));
        wf.add_block(Block::new("p", BlockType::Parallel));
        wf.add_block(Block::new("a", BlockType::Function));
        wf.add_parallel(flowcore::ParallelRegion::count("p", vec!["a"], 2));

        let mut ctx = ExecutionContext::new(wf.id, "start");
        let out = json!({"user": {"name": "ada", "tags": ["x", "y"]}, "n": 2});
        ctx.set_state(
            "start",
            BlockState::success(out.as_object().unwrap().clone(), 0),
        );
        let vid = ctx.register_virtual("a", "p", 1);
        ctx.set_state(
            vid,
            BlockState::success(json!({"v": 11}).as_object().unwrap().clone(), 0),
        );
        ctx.environment_variables
            .insert("API_KEY".to_string(), "secret".to_string());
        (wf, ctx)
    }

    #[test]
    fn resolves_whole_references_to_values() {
        let (wf, ctx) = fixture();
        let r = ReferenceResolver::new();
        let scope = BlockScope::default();

        assert_eq!(
            r.resolve_value(&json!("<start.user.tags.1>"), &wf, &ctx, &scope).unwrap(),
            json!("y")
        );
        assert_eq!(
            r.resolve_value(&json!("<starthere.n>"), &wf, &ctx, &scope).unwrap(),
            json!(2)
        );
    }

    #[test]
    fn interpolates_embedded_references_and_env() {
        let (wf, ctx) = fixture();
        let r = ReferenceResolver::new();
        let value = r
            .resolve_value(
                &json!("hi <start.user.name>, key={{API_KEY}}, 1 < 2"),
                &wf,
                &ctx,
                &BlockScope::default(),
            )
            .unwrap();

        assert_eq!(value, json!("hi ada, key=secret, 1 < 2"));
    }

    #[test]
    fn sibling_references_stay_inside_the_instance() {
        let (wf, ctx) = fixture();
        let r = ReferenceResolver::new();
        let scope = BlockScope {
            loop_scope: None,
            parallel: Some(ParallelScope {
                parallel_id: "p".to_string(),
                index: 1,
                item: Some(json!("b")),
                items: None,
            }),
        };

        assert_eq!(r.resolve_value(&json!("<a.v>"), &wf, &ctx, &scope).unwrap(), json!(11));
        assert_eq!(
            r.resolve_value(&json!("<parallel.currentItem>"), &wf, &ctx, &scope).unwrap(),
            json!("b")
        );
        assert_eq!(
            r.resolve_value(&json!("<parallel.index>"), &wf, &ctx, &scope).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn unknown_heads_are_left_alone() {
        let (wf, ctx) = fixture();
        let r = ReferenceResolver::new();

        assert_eq!(
            r.resolve_value(&json!("<div>"), &wf, &ctx, &BlockScope::default()).unwrap(),
            json!("<div>")
        );
    }
}
