use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::{BlockId, BlockType, Workflow, WorkflowId};

pub type ExecutionId = Uuid;

/// Normalized, open-ended output record of a block
pub type BlockOutput = Map<String, Value>;

/// Finalized state of a real or virtual block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockState {
    pub output: BlockOutput,
    pub executed: bool,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl BlockState {
    pub fn success(output: BlockOutput, execution_time_ms: u64) -> Self {
        Self {
            output,
            executed: true,
            execution_time_ms,
            error: None,
        }
    }

    pub fn failure(output: BlockOutput, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            output,
            executed: true,
            execution_time_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// One append-only entry of the run's block log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLog {
    pub block_id: String,
    pub block_name: String,
    pub block_type: BlockType,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub input: Option<BlockOutput>,
    #[serde(default)]
    pub output: Option<BlockOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Routing decisions recorded by routers and conditions, keyed by the
/// deciding (real or virtual) block id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decisions {
    pub router: HashMap<String, BlockId>,
    pub condition: HashMap<String, String>,
}

/// Identity of one parallel instance of a body node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBlock {
    pub block_id: BlockId,
    pub parallel_id: String,
    pub iteration: usize,
}

pub fn virtual_block_id(block_id: &str, parallel_id: &str, iteration: usize) -> String {
    format!("{}_parallel_{}_iteration_{}", block_id, parallel_id, iteration)
}

/// Progress of one loop region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration: usize,
    pub max_iterations: usize,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    /// Outputs of the body blocks, per finished iteration
    #[serde(default)]
    pub results: BTreeMap<usize, BlockOutput>,
}

impl LoopState {
    pub fn current_item(&self) -> Option<&Value> {
        self.items.as_ref().and_then(|items| items.get(self.iteration))
    }
}

/// Per-instance bookkeeping of one parallel region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelState {
    pub count: usize,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub completed_instances: BTreeSet<usize>,
    /// Outputs of the body blocks, per finished instance
    #[serde(default)]
    pub results: BTreeMap<usize, BlockOutput>,
}

impl ParallelState {
    pub fn completed_count(&self) -> usize {
        self.completed_instances.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() >= self.count
    }

    pub fn item(&self, index: usize) -> Option<&Value> {
        self.items.as_ref().and_then(|items| items.get(index))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopScope {
    pub loop_id: String,
    pub index: usize,
    pub item: Option<Value>,
    pub items: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelScope {
    pub parallel_id: String,
    pub index: usize,
    pub item: Option<Value>,
    pub items: Option<Vec<Value>>,
}

/// Loop and parallel values visible to one block execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockScope {
    pub loop_scope: Option<LoopScope>,
    pub parallel: Option<ParallelScope>,
}

/// Mutable state threaded through one run.
///
/// Serializable so a debug run can hand it back to the caller between layers
/// and be resumed from the exact same state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub entry_block: BlockId,
    pub started_at: DateTime<Utc>,
    pub block_states: HashMap<String, BlockState>,
    pub block_logs: Vec<BlockLog>,
    pub decisions: Decisions,
    pub loops: HashMap<String, LoopState>,
    pub parallels: HashMap<String, ParallelState>,
    pub completed_regions: HashSet<String>,
    pub virtual_blocks: HashMap<String, VirtualBlock>,
    pub active_path: HashSet<String>,
    pub executed_blocks: HashSet<String>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub workflow_variables: Map<String, Value>,
    /// Layer computed but not yet executed (debug mode)
    #[serde(default)]
    pub pending_blocks: Vec<String>,
}

impl ExecutionContext {
    pub fn new(workflow_id: WorkflowId, entry_block: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id,
            entry_block: entry_block.into(),
            started_at: Utc::now(),
            block_states: HashMap::new(),
            block_logs: Vec::new(),
            decisions: Decisions::default(),
            loops: HashMap::new(),
            parallels: HashMap::new(),
            completed_regions: HashSet::new(),
            virtual_blocks: HashMap::new(),
            active_path: HashSet::new(),
            executed_blocks: HashSet::new(),
            environment_variables: HashMap::new(),
            workflow_variables: Map::new(),
            pending_blocks: Vec::new(),
        }
    }

    pub fn state(&self, id: &str) -> Option<&BlockState> {
        self.block_states.get(id)
    }

    pub fn output(&self, id: &str) -> Option<&BlockOutput> {
        self.block_states.get(id).map(|s| &s.output)
    }

    pub fn is_executed(&self, id: &str) -> bool {
        self.executed_blocks.contains(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.block_states.get(id).is_some_and(BlockState::is_failed)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active_path.contains(id)
    }

    pub fn is_completed(&self, region_id: &str) -> bool {
        self.completed_regions.contains(region_id)
    }

    /// Store a finished block's state and mark it executed
    pub fn set_state(&mut self, id: impl Into<String>, state: BlockState) {
        let id = id.into();
        self.executed_blocks.insert(id.clone());
        self.block_states.insert(id, state);
    }

    /// Forget a block's state so it can run again
    pub fn reset_block(&mut self, id: &str) {
        self.executed_blocks.remove(id);
        self.block_states.remove(id);
        self.active_path.remove(id);
        self.decisions.router.remove(id);
        self.decisions.condition.remove(id);
    }

    /// Register a virtual id and return it
    pub fn register_virtual(&mut self, block_id: &str, parallel_id: &str, iteration: usize) -> String {
        let id = virtual_block_id(block_id, parallel_id, iteration);
        self.virtual_blocks
            .entry(id.clone())
            .or_insert_with(|| VirtualBlock {
                block_id: block_id.to_string(),
                parallel_id: parallel_id.to_string(),
                iteration,
            });
        id
    }

    /// Graph block id behind a real or virtual id
    pub fn original_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.virtual_blocks
            .get(id)
            .map(|v| v.block_id.as_str())
            .unwrap_or(id)
    }

    pub fn virtual_block(&self, id: &str) -> Option<&VirtualBlock> {
        self.virtual_blocks.get(id)
    }

    /// Loop and parallel values for the block behind `id`
    pub fn scope_for(&self, workflow: &Workflow, id: &str) -> BlockScope {
        let mut scope = BlockScope::default();

        if let Some(v) = self.virtual_blocks.get(id) {
            if let Some(state) = self.parallels.get(&v.parallel_id) {
                scope.parallel = Some(ParallelScope {
                    parallel_id: v.parallel_id.clone(),
                    index: v.iteration,
                    item: state.item(v.iteration).cloned(),
                    items: state.items.clone(),
                });
            }
        }

        let original = self.original_id(id);
        if let Some(region) = workflow.loops.values().find(|l| l.nodes.iter().any(|n| n == original)) {
            if let Some(state) = self.loops.get(&region.id) {
                scope.loop_scope = Some(LoopScope {
                    loop_id: region.id.clone(),
                    index: state.iteration,
                    item: state.current_item().cloned(),
                    items: state.items.clone(),
                });
            }
        }

        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn virtual_ids_resolve_to_their_node() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "start");
        let vid = ctx.register_virtual("a", "p", 2);

        assert_eq!(vid, "a_parallel_p_iteration_2");
        assert_eq!(ctx.original_id(&vid), "a");
        assert_eq!(ctx.original_id("b"), "b");
    }

    #[test]
    fn reset_forgets_state_and_decisions() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "start");
        ctx.set_state("r", BlockState::success(Map::new(), 1));
        ctx.active_path.insert("r".to_string());
        ctx.decisions.router.insert("r".to_string(), "a".to_string());

        ctx.reset_block("r");

        assert!(!ctx.is_executed("r"));
        assert!(!ctx.is_active("r"));
        assert!(ctx.decisions.router.is_empty());
    }

    #[test]
    fn context_survives_a_json_round_trip() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "start");
        let mut out = Map::new();
        out.insert("x".to_string(), json!(1));
        ctx.set_state("start", BlockState::success(out, 0));

        let restored: ExecutionContext =
            serde_json::from_value(serde_json::to_value(&ctx).unwrap()).unwrap();
        assert_eq!(restored.output("start").unwrap()["x"], json!(1));
        assert!(restored.is_executed("start"));
    }
}
