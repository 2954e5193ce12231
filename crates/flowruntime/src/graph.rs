use flowcore::{Block, Connection, LoopRegion, ParallelRegion, Workflow, WorkflowError};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Read-only index over a validated workflow, built once per run
pub struct WorkflowGraph<'a> {
    pub workflow: &'a Workflow,
    blocks: HashMap<&'a str, &'a Block>,
    incoming: HashMap<&'a str, Vec<&'a Connection>>,
    outgoing: HashMap<&'a str, Vec<&'a Connection>>,
    loop_of: HashMap<&'a str, &'a LoopRegion>,
    parallel_of: HashMap<&'a str, &'a ParallelRegion>,
}

impl<'a> WorkflowGraph<'a> {
    /// Validate the workflow and index it
    pub fn build(workflow: &'a Workflow) -> Result<Self, WorkflowError> {
        workflow.validate()?;
        check_acyclic(workflow)?;

        let blocks = workflow
            .blocks
            .iter()
            .map(|b| (b.id.as_str(), b))
            .collect();

        let mut incoming: HashMap<&str, Vec<&Connection>> = HashMap::new();
        let mut outgoing: HashMap<&str, Vec<&Connection>> = HashMap::new();
        for conn in &workflow.connections {
            incoming.entry(conn.target.as_str()).or_default().push(conn);
            outgoing.entry(conn.source.as_str()).or_default().push(conn);
        }

        let mut loop_of = HashMap::new();
        for region in workflow.loops.values() {
            for node in &region.nodes {
                loop_of.insert(node.as_str(), region);
            }
        }
        let mut parallel_of = HashMap::new();
        for region in workflow.parallels.values() {
            for node in &region.nodes {
                parallel_of.insert(node.as_str(), region);
            }
        }

        Ok(Self {
            workflow,
            blocks,
            incoming,
            outgoing,
            loop_of,
            parallel_of,
        })
    }

    pub fn block(&self, id: &str) -> Option<&'a Block> {
        self.blocks.get(id).copied()
    }

    /// Blocks in definition order
    pub fn blocks(&self) -> impl Iterator<Item = &'a Block> + 'a {
        self.workflow.blocks.iter()
    }

    pub fn incoming(&self, id: &str) -> &[&'a Connection] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing(&self, id: &str) -> &[&'a Connection] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn loop_of(&self, id: &str) -> Option<&'a LoopRegion> {
        self.loop_of.get(id).copied()
    }

    pub fn parallel_of(&self, id: &str) -> Option<&'a ParallelRegion> {
        self.parallel_of.get(id).copied()
    }

    /// Id a reference to `block_id` resolves to from inside parallel
    /// instance `instance`: a sibling body node maps to its virtual id,
    /// anything else keeps its real id.
    pub fn scoped_id(&self, block_id: &str, instance: Option<(&str, usize)>) -> String {
        match (instance, self.parallel_of(block_id)) {
            (Some((parallel_id, i)), Some(region)) if region.id == parallel_id => {
                flowcore::virtual_block_id(block_id, parallel_id, i)
            }
            _ => block_id.to_string(),
        }
    }
}

/// Loop re-entry is driven by the loop manager, so the edge set itself
/// must stay acyclic.
fn check_acyclic(workflow: &Workflow) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();

    for block in &workflow.blocks {
        index.insert(block.id.as_str(), graph.add_node(block.id.as_str()));
    }
    for conn in &workflow.connections {
        let from = index
            .get(conn.source.as_str())
            .ok_or_else(|| WorkflowError::BlockNotFound(conn.source.clone()))?;
        let to = index
            .get(conn.target.as_str())
            .ok_or_else(|| WorkflowError::BlockNotFound(conn.target.clone()))?;
        graph.add_edge(*from, *to, ());
    }

    if toposort(&graph, None).is_err() {
        return Err(WorkflowError::CyclicDependency);
    }
    Ok(())
}
