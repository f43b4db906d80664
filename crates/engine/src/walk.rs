//! The ready-set scheduler both walks run on.
//!
//! Workers dequeue nodes whose predecessors have all completed, up to the
//! configured parallelism (default 10), spawning in canonical-key order so
//! identical inputs walk identically. A failed node poisons its transitive
//! successors: they are recorded as skipped with a pointer to the root
//! cause and never execute. Soft cancellation stops new nodes from
//! starting while in-flight work drains; hard cancellation abandons the
//! walk outright.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use gantry_core::diags::{Diagnostic, Diagnostics};
use petgraph::graph::NodeIndex;

use crate::graph::{ExpandNode, Node, WalkGraph};

/// Default worker count for both walks.
pub const DEFAULT_PARALLELISM: usize = 10;

#[derive(Clone)]
pub struct WalkOptions {
  pub parallelism: usize,
  /// Soft cancel: no new nodes start, in-flight calls return.
  pub cancel: CancellationToken,
  /// Hard cancel: abandon in-flight work and return immediately.
  pub hard_cancel: CancellationToken,
}

impl Default for WalkOptions {
  fn default() -> Self {
    WalkOptions {
      parallelism: DEFAULT_PARALLELISM,
      cancel: CancellationToken::new(),
      hard_cancel: CancellationToken::new(),
    }
  }
}

/// What executing one node produced.
#[derive(Debug)]
pub enum NodeOutcome {
  Done,
  /// Dynamic expansion: append these nodes, fanning edges out from the
  /// origin and in to its successors.
  Expanded(Vec<ExpandNode>),
  Failed(Diagnostic),
  /// Internal: the node was abandoned because the walk was cancelled
  /// before it started executing.
  Cancelled,
}

/// Executes one node of the walk. Implementations publish results through
/// shared context they own; the walker only schedules.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
  async fn execute(&self, node: Node) -> NodeOutcome;
}

/// The walker's summary: diagnostics from failed nodes, skipped nodes with
/// their root cause, and whether the walk ran to the end.
pub struct WalkReport {
  pub diags: Diagnostics,
  /// (skipped node key, failed node key that caused it)
  pub skipped: Vec<(String, String)>,
  pub complete: bool,
}

/// Walks the graph to completion, cancellation, or exhaustion by failure.
pub async fn walk(mut graph: WalkGraph, executor: Arc<dyn NodeExecutor>, options: &WalkOptions) -> WalkReport {
  let mut remaining: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.predecessors(idx).len()))
    .collect();
  let mut ready: BTreeMap<String, NodeIndex> = remaining
    .iter()
    .filter(|(_, &count)| count == 0)
    .map(|(&idx, _)| (graph.node(idx).key(), idx))
    .collect();

  let mut completed: HashSet<NodeIndex> = HashSet::new();
  let mut skipped: HashMap<NodeIndex, NodeIndex> = HashMap::new();
  let mut diags = Diagnostics::new();
  let mut hard_cancelled = false;

  let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
  let mut tasks: JoinSet<(NodeIndex, NodeOutcome)> = JoinSet::new();

  loop {
    if !options.cancel.is_cancelled() {
      while let Some((key, idx)) = pop_first(&mut ready) {
        debug!(node = %key, "node ready");
        let node = graph.node(idx).clone();
        let executor = executor.clone();
        let semaphore = semaphore.clone();
        let cancel = options.cancel.clone();
        tasks.spawn(async move {
          let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
          if cancel.is_cancelled() {
            return (idx, NodeOutcome::Cancelled);
          }
          (idx, executor.execute(node).await)
        });
      }
    }

    if tasks.is_empty() {
      break;
    }

    let joined = tokio::select! {
      _ = options.hard_cancel.cancelled() => {
        warn!("hard cancellation: abandoning in-flight work");
        tasks.abort_all();
        hard_cancelled = true;
        break;
      }
      joined = tasks.join_next() => joined,
    };

    let (idx, outcome) = match joined {
      Some(Ok(result)) => result,
      Some(Err(join_err)) => {
        error!(error = %join_err, "walk task panicked");
        diags.push(
          Diagnostic::error("internal error in graph walk")
            .with_detail(format!("a node task panicked: {}", join_err)),
        );
        continue;
      }
      None => break,
    };

    match outcome {
      NodeOutcome::Done => {
        complete_node(&graph, idx, &mut remaining, &mut completed, &skipped, &mut ready);
      }
      NodeOutcome::Expanded(batch) => {
        let added = graph.expand(idx, batch, &completed);
        let added_set: HashSet<NodeIndex> = added.iter().copied().collect();
        for &new_idx in &added {
          let preds = graph
            .predecessors(new_idx)
            .into_iter()
            .filter(|p| !completed.contains(p))
            .count();
          remaining.insert(new_idx, preds);
          // Inherited fan-in edges raise the wait count of the origin's
          // successors.
          for succ in graph.successors(new_idx) {
            if !added_set.contains(&succ) && !completed.contains(&succ) {
              *remaining.entry(succ).or_insert(0) += 1;
            }
          }
        }
        complete_node(&graph, idx, &mut remaining, &mut completed, &skipped, &mut ready);
      }
      NodeOutcome::Failed(diag) => {
        error!(node = %graph.node(idx).key(), "node failed");
        diags.push(diag);
        skip_descendants(&graph, idx, &mut skipped);
      }
      NodeOutcome::Cancelled => {}
    }
  }

  let skipped_report: Vec<(String, String)> = {
    let mut entries: Vec<(String, String)> = skipped
      .iter()
      .map(|(&node, &cause)| (graph.node(node).key(), graph.node(cause).key()))
      .collect();
    entries.sort();
    entries
  };

  WalkReport {
    diags,
    skipped: skipped_report,
    complete: !hard_cancelled && !options.cancel.is_cancelled(),
  }
}

fn pop_first(ready: &mut BTreeMap<String, NodeIndex>) -> Option<(String, NodeIndex)> {
  let key = ready.keys().next()?.clone();
  let idx = ready.remove(&key)?;
  Some((key, idx))
}

fn complete_node(
  graph: &WalkGraph,
  idx: NodeIndex,
  remaining: &mut HashMap<NodeIndex, usize>,
  completed: &mut HashSet<NodeIndex>,
  skipped: &HashMap<NodeIndex, NodeIndex>,
  ready: &mut BTreeMap<String, NodeIndex>,
) {
  completed.insert(idx);
  for succ in graph.successors(idx) {
    let count = remaining.entry(succ).or_insert(0);
    *count = count.saturating_sub(1);
    if *count == 0 && !completed.contains(&succ) && !skipped.contains_key(&succ) {
      ready.insert(graph.node(succ).key(), succ);
    }
  }
}

/// Marks every transitive successor of a failed node as skipped, keeping
/// the original failure as the root cause.
fn skip_descendants(graph: &WalkGraph, failed: NodeIndex, skipped: &mut HashMap<NodeIndex, NodeIndex>) {
  let mut stack = graph.successors(failed);
  while let Some(idx) = stack.pop() {
    if skipped.contains_key(&idx) {
      continue;
    }
    skipped.insert(idx, failed);
    stack.extend(graph.successors(idx));
  }
}
