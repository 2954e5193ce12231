mod common;

use common::{function, runtime, workflow};
use flowcore::{
    Block, BlockError, BlockOutput, BlockType, HandlerOutput, LoopRegion, ParallelRegion,
    SourceHandle, Workflow,
};
use flowruntime::{ExecutionOptions, FnHandler};
use serde_json::json;

fn counted_loop(iterations: usize) -> Workflow {
    let mut wf = workflow("counted");
    wf.add_block(Block::new("counter", BlockType::Loop));
    wf.add_block(function("first").with_config("i", "<loop.index>"));
    wf.add_block(function("second").with_config("seen", "<first.i>"));
    wf.add_block(function("after").with_config("results", "<counter.results>"));
    wf.connect("start", "counter");
    wf.connect_handle("counter", "first", SourceHandle::LoopStart);
    wf.connect("first", "second");
    wf.connect_handle("counter", "after", SourceHandle::LoopEnd);
    wf.add_loop(LoopRegion::count("counter", vec!["first", "second"], iterations));
    wf
}

#[tokio::test]
async fn test_count_loop_runs_its_body_each_iteration() {
    let rt = runtime(vec![]);
    let result = rt
        .execute(&counted_loop(3), ExecutionOptions::new())
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("first"), 3);
    assert_eq!(result.executions_of("second"), 3);
    assert_eq!(result.executions_of("after"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    for (i, iteration) in results.iter().enumerate() {
        assert_eq!(iteration["first"]["i"], json!(i));
        assert_eq!(iteration["second"]["seen"], json!(i));
    }

    // The loop closes only after the last body block of the last iteration
    let last_second = result
        .logs
        .iter()
        .rposition(|l| l.block_id == "second")
        .unwrap();
    let after = result.logs.iter().position(|l| l.block_id == "after").unwrap();
    assert!(last_second < after);
}

#[tokio::test]
async fn test_for_each_loop_exposes_current_item() {
    let mut wf = workflow("each");
    wf.add_block(Block::new("each", BlockType::Loop));
    wf.add_block(function("body").with_config("item", "<loop.currentItem>"));
    wf.add_block(function("after").with_config("results", "<each.results>"));
    wf.connect("start", "each");
    wf.connect_handle("each", "body", SourceHandle::LoopStart);
    wf.connect_handle("each", "after", SourceHandle::LoopEnd);
    wf.add_loop(LoopRegion::for_each("each", vec!["body"], json!(["a", "b", "c"])));

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    let items: Vec<_> = result.output["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["body"]["item"].clone())
        .collect();
    assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn test_for_each_over_a_reference_with_no_items_skips_the_body() {
    let mut wf = workflow("empty-each");
    wf.add_block(Block::new("each", BlockType::Loop));
    wf.add_block(function("body"));
    wf.add_block(function("after").with_config("done", true));
    wf.connect("start", "each");
    wf.connect_handle("each", "body", SourceHandle::LoopStart);
    wf.connect_handle("each", "after", SourceHandle::LoopEnd);
    wf.add_loop(LoopRegion::for_each("each", vec!["body"], "<start.rows>"));

    let rt = runtime(vec![]);
    let result = rt
        .execute(&wf, ExecutionOptions::new().with_input(json!({"rows": []})))
        .await
        .unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("body"), 0);
    assert_eq!(result.output["done"], json!(true));
}

fn fan_out(region: ParallelRegion) -> Workflow {
    let mut wf = workflow("fan-out");
    wf.add_block(Block::new("fan", BlockType::Parallel));
    wf.add_block(
        function("work")
            .with_config("i", "<parallel.index>")
            .with_config("item", "<parallel.currentItem>"),
    );
    wf.add_block(function("check").with_config("from_work", "<work.i>"));
    wf.add_block(function("gather").with_config("results", "<fan.results>"));
    wf.connect("start", "fan");
    wf.connect_handle("fan", "work", SourceHandle::ParallelStart);
    wf.connect("work", "check");
    wf.connect_handle("fan", "gather", SourceHandle::ParallelEnd);
    wf.add_parallel(region);
    wf
}

#[tokio::test]
async fn test_parallel_count_produces_ordered_independent_instances() {
    let wf = fan_out(ParallelRegion::count("fan", vec!["work", "check"], 4));

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("work"), 4);
    assert_eq!(result.executions_of("check"), 4);
    assert_eq!(result.executions_of("gather"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    for (i, instance) in results.iter().enumerate() {
        assert_eq!(instance["work"]["i"], json!(i));
        // Sibling references stay inside their own instance
        assert_eq!(instance["check"]["from_work"], json!(i));
    }
}

#[tokio::test]
async fn test_parallel_collection_distributes_items() {
    let wf = fan_out(ParallelRegion::collection(
        "fan",
        vec!["work", "check"],
        json!({"x": 1, "y": 2}),
    ));

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    let items: Vec<_> = result.output["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["work"]["item"].clone())
        .collect();
    assert_eq!(items, vec![json!(["x", 1]), json!(["y", 2])]);
}

#[tokio::test]
async fn test_parallel_instances_follow_their_own_conditions() {
    let mut wf = workflow("conditional-fan");
    wf.add_block(Block::new("fan", BlockType::Parallel));
    wf.add_block(Block::new("check", BlockType::Condition));
    wf.add_block(function("even").with_config("even", true));
    wf.add_block(function("odd").with_config("odd", true));
    wf.add_block(function("gather").with_config("results", "<fan.results>"));
    wf.connect("start", "fan");
    wf.connect_handle("fan", "check", SourceHandle::ParallelStart);
    wf.connect_handle("check", "even", SourceHandle::condition("even"));
    wf.connect_handle("check", "odd", SourceHandle::condition("odd"));
    wf.connect_handle("fan", "gather", SourceHandle::ParallelEnd);
    wf.add_parallel(ParallelRegion::count("fan", vec!["check", "even", "odd"], 3));

    let parity = FnHandler::for_type(BlockType::Condition, |ctx| {
        let index = ctx.scope.parallel.as_ref().map(|p| p.index).unwrap_or_default();
        let chosen = if index % 2 == 0 { "even" } else { "odd" };
        let mut output = BlockOutput::new();
        output.insert("selectedConditionId".to_string(), json!(chosen));
        Ok(HandlerOutput::Output(output))
    });
    let rt = runtime(vec![parity]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("even"), 2);
    assert_eq!(result.executions_of("odd"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[1].get("even").is_none());
    assert_eq!(results[1]["odd"]["odd"], json!(true));
}

#[tokio::test]
async fn test_block_after_a_region_waits_for_completion() {
    let mut wf = fan_out(ParallelRegion::count("fan", vec!["work", "check"], 2));
    wf.add_block(function("tail").with_config("gathered", "<gather.results>"));
    wf.connect("gather", "tail");

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.output["gathered"].as_array().map(Vec::len), Some(2));
}

/// `start -> x1 -> x2 -> a`, where `a` is also the body of a region
/// entered straight from `start`
fn body_waiting_outside(wf: &mut Workflow, region: &str, start_handle: SourceHandle, end_handle: SourceHandle) {
    wf.add_block(function("x1"));
    wf.add_block(function("x2").with_config("v", 7));
    wf.add_block(function("a").with_config("seen", "<x2.v>"));
    wf.add_block(function("after").with_config("results", format!("<{}.results>", region)));
    wf.connect("start", region);
    wf.connect("start", "x1");
    wf.connect("x1", "x2");
    wf.connect("x2", "a");
    wf.connect_handle(region, "a", start_handle);
    wf.connect_handle(region, "after", end_handle);
}

#[tokio::test]
async fn test_loop_body_waits_for_blocks_outside_the_loop() {
    let mut wf = workflow("loop-outside-dep");
    wf.add_block(Block::new("l", BlockType::Loop));
    body_waiting_outside(&mut wf, "l", SourceHandle::LoopStart, SourceHandle::LoopEnd);
    wf.add_loop(LoopRegion::count("l", vec!["a"], 3));

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("a"), 3);
    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r["a"]["seen"] == json!(7)));
}

#[tokio::test]
async fn test_parallel_body_waits_for_blocks_outside_the_region() {
    let mut wf = workflow("parallel-outside-dep");
    wf.add_block(Block::new("p", BlockType::Parallel));
    body_waiting_outside(&mut wf, "p", SourceHandle::ParallelStart, SourceHandle::ParallelEnd);
    wf.add_parallel(ParallelRegion::count("p", vec!["a"], 4));

    let rt = runtime(vec![]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("a"), 4);
    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r["a"]["seen"] == json!(7)));
}

#[tokio::test]
async fn test_error_edge_inside_a_parallel_instance() {
    let mut wf = workflow("parallel-errors");
    wf.add_block(Block::new("fan", BlockType::Parallel));
    wf.add_block(function("work"));
    wf.add_block(function("ok").with_config("ok", true));
    wf.add_block(function("recover").with_config("recovered", true));
    wf.add_block(function("gather").with_config("results", "<fan.results>"));
    wf.connect("start", "fan");
    wf.connect_handle("fan", "work", SourceHandle::ParallelStart);
    wf.connect("work", "ok");
    wf.connect_handle("work", "recover", SourceHandle::Error);
    wf.connect_handle("fan", "gather", SourceHandle::ParallelEnd);
    wf.add_parallel(ParallelRegion::count("fan", vec!["work", "ok", "recover"], 3));

    let fail_second = FnHandler::for_block("work", |ctx| {
        match ctx.scope.parallel.as_ref().map(|p| p.index) {
            Some(1) => Err(BlockError::ExecutionFailed("instance 1 broke".to_string())),
            _ => Ok(HandlerOutput::Output(ctx.inputs.clone())),
        }
    });
    let rt = runtime(vec![fail_second]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("ok"), 2);
    assert_eq!(result.executions_of("recover"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["ok"]["ok"], json!(true));
    assert!(results[1].get("ok").is_none());
    assert_eq!(results[1]["recover"]["recovered"], json!(true));
    assert!(results[2].get("recover").is_none());
}

#[tokio::test]
async fn test_router_inside_a_parallel_instance() {
    let mut wf = workflow("parallel-routing");
    wf.add_block(Block::new("fan", BlockType::Parallel));
    wf.add_block(Block::new("route", BlockType::Router));
    wf.add_block(function("low").with_config("low", true));
    wf.add_block(function("high").with_config("high", true));
    wf.add_block(function("gather").with_config("results", "<fan.results>"));
    wf.connect("start", "fan");
    wf.connect_handle("fan", "route", SourceHandle::ParallelStart);
    wf.connect("route", "low");
    wf.connect("route", "high");
    wf.connect_handle("fan", "gather", SourceHandle::ParallelEnd);
    wf.add_parallel(ParallelRegion::count("fan", vec!["route", "low", "high"], 3));

    let by_index = FnHandler::for_type(BlockType::Router, |ctx| {
        let index = ctx.scope.parallel.as_ref().map(|p| p.index).unwrap_or_default();
        let target = if index < 2 { "low" } else { "high" };
        let mut output = BlockOutput::new();
        output.insert("selectedPath".to_string(), json!({ "blockId": target }));
        Ok(HandlerOutput::Output(output))
    });
    let rt = runtime(vec![by_index]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("low"), 2);
    assert_eq!(result.executions_of("high"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert!(results[0].get("high").is_none());
    assert!(results[2].get("low").is_none());
    assert_eq!(results[2]["high"]["high"], json!(true));
}

#[tokio::test]
async fn test_router_inside_a_loop_decides_again_each_iteration() {
    let mut wf = workflow("loop-routing");
    wf.add_block(Block::new("l", BlockType::Loop));
    wf.add_block(Block::new("route", BlockType::Router));
    wf.add_block(function("a").with_config("branch", "a"));
    wf.add_block(function("b").with_config("branch", "b"));
    wf.add_block(function("after").with_config("results", "<l.results>"));
    wf.connect("start", "l");
    wf.connect_handle("l", "route", SourceHandle::LoopStart);
    wf.connect("route", "a");
    wf.connect("route", "b");
    wf.connect_handle("l", "after", SourceHandle::LoopEnd);
    wf.add_loop(LoopRegion::count("l", vec!["route", "a", "b"], 2));

    let alternate = FnHandler::for_type(BlockType::Router, |ctx| {
        let index = ctx.scope.loop_scope.as_ref().map(|l| l.index).unwrap_or_default();
        let target = if index == 0 { "a" } else { "b" };
        let mut output = BlockOutput::new();
        output.insert("selectedPath".to_string(), json!({ "blockId": target }));
        Ok(HandlerOutput::Output(output))
    });
    let rt = runtime(vec![alternate]);
    let result = rt.execute(&wf, ExecutionOptions::new()).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.executions_of("a"), 1);
    assert_eq!(result.executions_of("b"), 1);

    let results = result.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["a"]["branch"], json!("a"));
    assert!(results[0].get("b").is_none());
    assert_eq!(results[1]["b"]["branch"], json!("b"));
    assert!(results[1].get("a").is_none());
}
