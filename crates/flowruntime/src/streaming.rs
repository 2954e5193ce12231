//! Streaming pipeline.
//!
//! A handler's live stream is teed by one producer task into two unbounded
//! channels. The caller copy goes to the observer (optionally reduced to the
//! selected response fields); the internal copy is drained here and its
//! completion gates the block's final state.

use flowcore::{Block, BlockError, BlockOutput, ExecutionObserver, StreamingExecution};
use futures::channel::mpsc;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;

type Chunk = Result<String, BlockError>;

/// Tee the stream, feed the observer, and finalize the block output from
/// the internal copy.
///
/// Draining errors are best effort: whatever content arrived before the
/// error still finalizes the output, and the error is returned alongside.
pub async fn consume(
    execution: StreamingExecution,
    block: &Block,
    selected_outputs: &[String],
    observer: Option<&Arc<dyn ExecutionObserver>>,
) -> (BlockOutput, Option<BlockError>) {
    let StreamingExecution {
        block_id,
        stream,
        output: metadata,
    } = execution;

    let (internal_tx, internal_rx) = mpsc::unbounded::<Chunk>();
    let (caller_tx, caller_rx) = mpsc::unbounded::<Chunk>();
    let caller_tx = observer.is_some().then_some(caller_tx);

    let producer = tokio::spawn(tee(stream, internal_tx, caller_tx));

    let caller = async {
        let Some(observer) = observer else {
            return;
        };
        let fields = selected_fields(block, selected_outputs);
        let caller_stream: BoxStream<'static, Chunk> = if fields.is_empty() {
            caller_rx.boxed()
        } else {
            filter_fields(caller_rx.boxed(), fields)
        };
        let caller_execution = StreamingExecution {
            block_id: block_id.clone(),
            stream: caller_stream,
            output: metadata.clone(),
        };
        if let Err(e) = observer.on_stream(caller_execution).await {
            tracing::warn!("Stream callback for block {} failed: {}", block_id, e);
        }
    };

    let ((), (content, error)) = tokio::join!(caller, drain(internal_rx));

    if let Err(e) = producer.await {
        tracing::warn!("Stream producer for block {} aborted: {}", block.id, e);
    }
    if let Some(e) = &error {
        tracing::warn!(
            "Stream of block {} failed after {} bytes: {}",
            block.id,
            content.len(),
            e
        );
    }

    (finalize_output(block, metadata, content), error)
}

async fn tee(
    mut stream: BoxStream<'static, Chunk>,
    internal: mpsc::UnboundedSender<Chunk>,
    caller: Option<mpsc::UnboundedSender<Chunk>>,
) {
    while let Some(chunk) = stream.next().await {
        let failed = chunk.is_err();
        if let Some(tx) = &caller {
            // The caller may drop its copy early; the internal copy still runs
            let _ = tx.unbounded_send(chunk.clone());
        }
        if internal.unbounded_send(chunk).is_err() || failed {
            break;
        }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Chunk>) -> (String, Option<BlockError>) {
    let mut content = String::new();
    while let Some(chunk) = rx.next().await {
        match chunk {
            Ok(text) => content.push_str(&text),
            Err(e) => return (content, Some(e)),
        }
    }
    (content, None)
}

/// Final state of a streamed block: the declared response shape parsed from
/// the content, or the content as plain text, merged over the non-content
/// metadata.
pub fn finalize_output(block: &Block, metadata: BlockOutput, content: String) -> BlockOutput {
    let mut output = metadata;

    if block.response_format().is_some() {
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(fields)) => {
                output.extend(fields);
                return output;
            }
            Ok(_) => {
                tracing::warn!("Structured response of block {} is not an object", block.id);
            }
            Err(e) => {
                tracing::warn!("Could not parse structured response of block {}: {}", block.id, e);
            }
        }
    }

    output.insert("content".to_string(), Value::String(content));
    output
}

/// Fields of `block` the caller selected, from `blockId.field` entries
fn selected_fields(block: &Block, selected_outputs: &[String]) -> Vec<String> {
    if block.response_format().is_none() {
        return Vec::new();
    }
    let prefix = format!("{}.", block.id);
    selected_outputs
        .iter()
        .filter_map(|s| s.strip_prefix(&prefix))
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

fn filter_fields(stream: BoxStream<'static, Chunk>, fields: Vec<String>) -> BoxStream<'static, Chunk> {
    stream
        .scan(ResponseFieldFilter::new(fields), |filter, chunk| {
            future::ready(Some(match chunk {
                Ok(text) => filter.push(&text).map(Ok),
                Err(e) => Some(Err(e)),
            }))
        })
        .filter_map(future::ready)
        .boxed()
}

/// Extracts selected fields from a JSON response arriving in chunks.
///
/// Emits once, as soon as the buffered text parses as a JSON object.
#[derive(Debug)]
pub struct ResponseFieldFilter {
    fields: Vec<String>,
    buffer: String,
    emitted: bool,
}

impl ResponseFieldFilter {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            buffer: String::new(),
            emitted: false,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if self.emitted {
            return None;
        }
        self.buffer.push_str(chunk);

        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&self.buffer) else {
            return None;
        };
        self.emitted = true;

        let parts: Vec<String> = self
            .fields
            .iter()
            .filter_map(|f| object.get(f))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::BlockType;
    use serde_json::json;

    #[test]
    fn filter_waits_for_a_complete_object() {
        let mut filter = ResponseFieldFilter::new(vec!["answer".to_string()]);

        assert_eq!(filter.push("{\"answer\": \"4"), None);
        assert_eq!(filter.push("2\", \"why\": \"math\"}"), Some("42".to_string()));
        assert_eq!(filter.push("trailing"), None);
    }

    #[test]
    fn plain_blocks_keep_text_content() {
        let block = Block::new("agent", BlockType::Agent);
        let mut meta = BlockOutput::new();
        meta.insert("tokens".to_string(), json!(3));

        let out = finalize_output(&block, meta, "abc".to_string());
        assert_eq!(out["content"], json!("abc"));
        assert_eq!(out["tokens"], json!(3));
    }

    #[test]
    fn structured_blocks_parse_their_content() {
        let block = Block::new("agent", BlockType::Agent)
            .with_config("response_format", json!({"type": "object"}));

        let out = finalize_output(&block, BlockOutput::new(), "{\"score\": 7}".to_string());
        assert_eq!(out["score"], json!(7));
        assert!(!out.contains_key("content"));
    }

    #[test]
    fn selects_fields_for_this_block_only() {
        let block = Block::new("agent", BlockType::Agent)
            .with_config("response_format", json!({"type": "object"}));
        let selected = vec!["agent.score".to_string(), "other.score".to_string()];

        assert_eq!(selected_fields(&block, &selected), vec!["score".to_string()]);
    }
}
