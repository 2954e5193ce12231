use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::WorkflowError;

pub type WorkflowId = Uuid;
pub type BlockId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopRegion>,
    #[serde(default)]
    pub parallels: BTreeMap<String, ParallelRegion>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            blocks: Vec::new(),
            connections: Vec::new(),
            loops: BTreeMap::new(),
            parallels: BTreeMap::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = block.id.clone();
        self.blocks.push(block);
        id
    }

    /// Plain success edge
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.connections.push(Connection::new(source, target));
    }

    /// Edge leaving a named output of the source block
    pub fn connect_handle(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        handle: SourceHandle,
    ) {
        self.connections
            .push(Connection::new(source, target).with_handle(handle));
    }

    pub fn add_loop(&mut self, region: LoopRegion) {
        self.loops.insert(region.id.clone(), region);
    }

    pub fn add_parallel(&mut self, region: ParallelRegion) {
        self.parallels.insert(region.id.clone(), region);
    }

    pub fn find_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.source == id)
    }

    /// Structural checks that need no execution state.
    ///
    /// Cycle detection and entry resolution live in the runtime, which owns
    /// the graph index.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut ids = HashSet::new();
        for block in &self.blocks {
            if !ids.insert(block.id.as_str()) {
                return Err(WorkflowError::DuplicateBlock(block.id.clone()));
            }
        }

        for conn in &self.connections {
            for end in [&conn.source, &conn.target] {
                if !ids.contains(end.as_str()) {
                    return Err(WorkflowError::DanglingConnection {
                        block_id: end.clone(),
                        source_id: conn.source.clone(),
                        target_id: conn.target.clone(),
                    });
                }
            }
            if conn.handle() == SourceHandle::Error {
                if let Some(source) = self.find_block(&conn.source) {
                    if !source.block_type.supports_error_edge() {
                        return Err(WorkflowError::UnsupportedErrorEdge {
                            block_id: source.id.clone(),
                            block_type: source.block_type.to_string(),
                        });
                    }
                }
            }
        }

        let mut owner: HashMap<&str, &str> = HashMap::new();
        for region in self.loops.values() {
            region.validate(self)?;
            for node in &region.nodes {
                if let Some(other) = owner.insert(node.as_str(), region.id.as_str()) {
                    return Err(WorkflowError::InvalidLoop {
                        loop_id: region.id.clone(),
                        reason: format!("block '{}' already belongs to region '{}'", node, other),
                    });
                }
            }
        }
        for region in self.parallels.values() {
            region.validate(self)?;
            for node in &region.nodes {
                if let Some(other) = owner.insert(node.as_str(), region.id.as_str()) {
                    return Err(WorkflowError::InvalidParallel {
                        parallel_id: region.id.clone(),
                        reason: format!("block '{}' already belongs to region '{}'", node, other),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Block specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub metadata: BlockMetadata,
}

fn default_enabled() -> bool {
    true
}

impl Block {
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            enabled: true,
            config: Map::new(),
            metadata: BlockMetadata::default(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = Some(category.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name, falling back to the id
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(&self.id)
    }

    /// Declared structured response shape, if any
    pub fn response_format(&self) -> Option<&Value> {
        self.config
            .get("response_format")
            .or_else(|| self.config.get("responseFormat"))
            .filter(|v| !v.is_null())
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.block_type, BlockType::Starter | BlockType::Trigger)
            || self.metadata.category.as_deref() == Some("triggers")
    }
}

/// Display information for a block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Closed set of block kinds the engine dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Starter,
    Trigger,
    Condition,
    Router,
    Loop,
    Parallel,
    Function,
    Agent,
    Api,
    Evaluator,
    Response,
    Delay,
    Debug,
    #[serde(other)]
    Unknown,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Starter => "starter",
            BlockType::Trigger => "trigger",
            BlockType::Condition => "condition",
            BlockType::Router => "router",
            BlockType::Loop => "loop",
            BlockType::Parallel => "parallel",
            BlockType::Function => "function",
            BlockType::Agent => "agent",
            BlockType::Api => "api",
            BlockType::Evaluator => "evaluator",
            BlockType::Response => "response",
            BlockType::Delay => "delay",
            BlockType::Debug => "debug",
            BlockType::Unknown => "unknown",
        }
    }

    /// Entry, condition and region blocks drive control flow themselves and
    /// never route failures through an error edge.
    pub fn supports_error_edge(&self) -> bool {
        !matches!(
            self,
            BlockType::Starter
                | BlockType::Trigger
                | BlockType::Condition
                | BlockType::Loop
                | BlockType::Parallel
        )
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge between blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: SourceHandle) -> Self {
        self.source_handle = match handle {
            SourceHandle::Source => None,
            other => Some(other.to_string()),
        };
        self
    }

    pub fn handle(&self) -> SourceHandle {
        SourceHandle::parse(self.source_handle.as_deref())
    }
}

/// Named output of a block an edge leaves from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceHandle {
    Source,
    Error,
    Condition(String),
    LoopStart,
    LoopEnd,
    ParallelStart,
    ParallelEnd,
}

impl SourceHandle {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") | Some("source") => SourceHandle::Source,
            Some("error") => SourceHandle::Error,
            Some("loop-start-source") => SourceHandle::LoopStart,
            Some("loop-end-source") => SourceHandle::LoopEnd,
            Some("parallel-start-source") => SourceHandle::ParallelStart,
            Some("parallel-end-source") => SourceHandle::ParallelEnd,
            Some(other) => match other.strip_prefix("condition-") {
                Some(id) => SourceHandle::Condition(id.to_string()),
                None => SourceHandle::Source,
            },
        }
    }

    pub fn condition(id: impl Into<String>) -> Self {
        SourceHandle::Condition(id.into())
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceHandle::Source => f.write_str("source"),
            SourceHandle::Error => f.write_str("error"),
            SourceHandle::Condition(id) => write!(f, "condition-{}", id),
            SourceHandle::LoopStart => f.write_str("loop-start-source"),
            SourceHandle::LoopEnd => f.write_str("loop-end-source"),
            SourceHandle::ParallelStart => f.write_str("parallel-start-source"),
            SourceHandle::ParallelEnd => f.write_str("parallel-end-source"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    #[default]
    Count,
    ForEach,
}

/// Re-entrant region executed once per iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRegion {
    pub id: String,
    pub nodes: Vec<BlockId>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default, alias = "loopType")]
    pub loop_type: LoopType,
    #[serde(default, alias = "forEachItems")]
    pub for_each_items: Option<Value>,
}

fn default_iterations() -> usize {
    5
}

impl LoopRegion {
    pub fn count(id: impl Into<String>, nodes: Vec<&str>, iterations: usize) -> Self {
        Self {
            id: id.into(),
            nodes: nodes.into_iter().map(String::from).collect(),
            iterations,
            loop_type: LoopType::Count,
            for_each_items: None,
        }
    }

    pub fn for_each(id: impl Into<String>, nodes: Vec<&str>, items: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            nodes: nodes.into_iter().map(String::from).collect(),
            iterations: default_iterations(),
            loop_type: LoopType::ForEach,
            for_each_items: Some(items.into()),
        }
    }

    fn validate(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidLoop {
            loop_id: self.id.clone(),
            reason,
        };

        match workflow.find_block(&self.id) {
            Some(b) if b.block_type == BlockType::Loop => {}
            _ => return Err(invalid("no loop block carries this id".to_string())),
        }
        validate_region_nodes(workflow, &self.nodes).map_err(invalid)?;

        match self.loop_type {
            LoopType::Count if self.iterations == 0 => {
                Err(invalid("iterations must be greater than zero".to_string()))
            }
            LoopType::ForEach => match &self.for_each_items {
                None => Err(invalid("forEach loops require a collection".to_string())),
                Some(items) if literal_is_empty(items) => {
                    Err(invalid("forEach collection is empty".to_string()))
                }
                Some(_) => Ok(()),
            },
            LoopType::Count => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParallelType {
    #[default]
    Count,
    Collection,
}

/// Fan-out region executed once per instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelRegion {
    pub id: String,
    pub nodes: Vec<BlockId>,
    #[serde(default, alias = "parallelType")]
    pub parallel_type: ParallelType,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub distribution: Option<Value>,
}

impl ParallelRegion {
    pub fn count(id: impl Into<String>, nodes: Vec<&str>, count: usize) -> Self {
        Self {
            id: id.into(),
            nodes: nodes.into_iter().map(String::from).collect(),
            parallel_type: ParallelType::Count,
            count: Some(count),
            distribution: None,
        }
    }

    pub fn collection(id: impl Into<String>, nodes: Vec<&str>, items: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            nodes: nodes.into_iter().map(String::from).collect(),
            parallel_type: ParallelType::Collection,
            count: None,
            distribution: Some(items.into()),
        }
    }

    fn validate(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidParallel {
            parallel_id: self.id.clone(),
            reason,
        };

        match workflow.find_block(&self.id) {
            Some(b) if b.block_type == BlockType::Parallel => {}
            _ => return Err(invalid("no parallel block carries this id".to_string())),
        }
        validate_region_nodes(workflow, &self.nodes).map_err(invalid)?;

        match self.parallel_type {
            ParallelType::Count if self.count == Some(0) => {
                Err(invalid("count must be greater than zero".to_string()))
            }
            ParallelType::Collection if self.distribution.is_none() => {
                Err(invalid("collection parallels require a distribution".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn validate_region_nodes(workflow: &Workflow, nodes: &[BlockId]) -> Result<(), String> {
    for node in nodes {
        match workflow.find_block(node) {
            None => return Err(format!("unknown block '{}'", node)),
            Some(b) if matches!(b.block_type, BlockType::Loop | BlockType::Parallel) => {
                return Err(format!("nested region block '{}' is not supported", node));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn literal_is_empty(items: &Value) -> bool {
    match items {
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Per-block timeout, overriding the runtime default
    #[serde(default)]
    pub block_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_source_handles() {
        assert_eq!(SourceHandle::parse(None), SourceHandle::Source);
        assert_eq!(SourceHandle::parse(Some("error")), SourceHandle::Error);
        assert_eq!(
            SourceHandle::parse(Some("condition-if")),
            SourceHandle::Condition("if".to_string())
        );
        assert_eq!(
            SourceHandle::parse(Some("parallel-end-source")),
            SourceHandle::ParallelEnd
        );
    }

    #[test]
    fn deserializes_camel_case_regions() {
        let wf: Workflow = serde_json::from_value(json!({
            "name": "wf",
            "blocks": [
                {"id": "start", "type": "starter"},
                {"id": "l", "type": "loop"},
                {"id": "a", "type": "function"},
                {"id": "x", "type": "something_new"}
            ],
            "connections": [
                {"source": "l", "target": "a", "sourceHandle": "loop-start-source"}
            ],
            "loops": {
                "l": {"id": "l", "nodes": ["a"], "loopType": "forEach", "forEachItems": [1, 2]}
            }
        }))
        .unwrap();

        assert_eq!(wf.connections[0].handle(), SourceHandle::LoopStart);
        assert_eq!(wf.loops["l"].loop_type, LoopType::ForEach);
        assert_eq!(wf.blocks[3].block_type, BlockType::Unknown);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn rejects_zero_iteration_loops() {
        let mut wf = Workflow::new("wf");
        wf.add_block(Block::new("l", BlockType::Loop));
        wf.add_block(Block::new("a", BlockType::Function));
        wf.add_loop(LoopRegion::count("l", vec!["a"], 0));

        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidLoop { .. })));
    }

    #[test]
    fn rejects_dangling_connections() {
        let mut wf = Workflow::new("wf");
        wf.add_block(Block::new("a", BlockType::Function));
        wf.connect("a", "ghost");

        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::DanglingConnection { .. })
        ));
    }

    #[test]
    fn rejects_error_edges_on_conditions() {
        let mut wf = Workflow::new("wf");
        wf.add_block(Block::new("c", BlockType::Condition));
        wf.add_block(Block::new("h", BlockType::Function));
        wf.connect_handle("c", "h", SourceHandle::Error);

        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::UnsupportedErrorEdge { .. })
        ));
    }
}
