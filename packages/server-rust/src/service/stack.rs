//! Two-phase middleware/adapter execution engine.
//!
//! An [`ExecutionStack`] holds adapters, then middlewares, then a terminal
//! handler. The request phase visits nodes in declared order; the response
//! phase visits them in reverse. When a node's `handle_request` returns
//! `false` the terminal is skipped and only the nodes that already ran
//! (the short-circuiting node included) see `handle_response`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::RequestContext;
use super::request::ServerRequest;
use super::response::ServerResponse;

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// Request-scoped values passed between nodes and phases.
///
/// Each node owns the slot under its own name; any node may read any slot.
#[derive(Default)]
pub struct SharedState {
    slots: HashMap<String, Option<Box<dyn Any + Send + Sync>>>,
}

impl SharedState {
    /// Creates state with an empty slot for each node name.
    #[must_use]
    pub fn for_nodes<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        Self {
            slots: names.into_iter().map(|n| (n.to_string(), None)).collect(),
        }
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.slots.insert(name.to_string(), Some(Box::new(value)));
    }

    /// Typed read of a slot. `None` if empty or of another type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.slots
            .get(name)
            .and_then(Option::as_ref)
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self, name: &str) -> Option<&mut T> {
        self.slots
            .get_mut(name)
            .and_then(Option::as_mut)
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Whether a slot exists for `name`, filled or not.
    #[must_use]
    pub fn has_slot(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.slots.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Node and terminal traits
// ---------------------------------------------------------------------------

/// A middleware or adapter.
#[async_trait]
pub trait StackNode: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Returns `false` to short-circuit the stack. A node that stops the
    /// stack is expected to have written the response.
    async fn handle_request(
        &self,
        ctx: &RequestContext,
        req: &mut ServerRequest,
        res: &mut ServerResponse,
        shared: &mut SharedState,
    ) -> bool;

    async fn handle_response(
        &self,
        ctx: &RequestContext,
        res: &mut ServerResponse,
        shared: &mut SharedState,
    );
}

/// The handler at the bottom of the stack.
#[async_trait]
pub trait Terminal: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, req: &mut ServerRequest, res: &mut ServerResponse);
}

// ---------------------------------------------------------------------------
// ExecutionStack
// ---------------------------------------------------------------------------

/// Ordered nodes plus a terminal. Order is fixed at construction.
pub struct ExecutionStack {
    nodes: Vec<Arc<dyn StackNode>>,
    adapter_count: usize,
    terminal: Arc<dyn Terminal>,
}

impl ExecutionStack {
    #[must_use]
    pub fn new(
        adapters: Vec<Arc<dyn StackNode>>,
        middlewares: Vec<Arc<dyn StackNode>>,
        terminal: Arc<dyn Terminal>,
    ) -> Self {
        let adapter_count = adapters.len();
        let mut nodes = adapters;
        nodes.extend(middlewares);
        Self {
            nodes,
            adapter_count,
            terminal,
        }
    }

    /// A stack with only a terminal.
    #[must_use]
    pub fn terminal_only(terminal: Arc<dyn Terminal>) -> Self {
        Self::new(Vec::new(), Vec::new(), terminal)
    }

    /// Node names in execution order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name())
    }

    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.adapter_count
    }

    /// Runs both phases for one request.
    pub async fn run(&self, ctx: &RequestContext, req: &mut ServerRequest, res: &mut ServerResponse) {
        let mut shared = SharedState::for_nodes(self.node_names());

        let mut ran = 0;
        let mut completed = true;
        for node in &self.nodes {
            ran += 1;
            if !node.handle_request(ctx, req, res, &mut shared).await {
                completed = false;
                break;
            }
        }

        if completed {
            self.terminal.handle(ctx, req, res).await;
        }

        for node in self.nodes[..ran].iter().rev() {
            node.handle_response(ctx, res, &mut shared).await;
        }
    }
}

impl std::fmt::Debug for ExecutionStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStack")
            .field("nodes", &self.node_names().collect::<Vec<_>>())
            .field("adapter_count", &self.adapter_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use switchyard_core::Headers;

    use super::*;
    use crate::service::request::Protocol;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        stop: bool,
        journal: Journal,
    }

    #[async_trait]
    impl StackNode for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle_request(
            &self,
            _ctx: &RequestContext,
            _req: &mut ServerRequest,
            res: &mut ServerResponse,
            shared: &mut SharedState,
        ) -> bool {
            self.journal.lock().push(format!("req:{}", self.name));
            shared.insert(&self.name, self.name.len());
            if self.stop {
                res.send_error(403, "stopped", None);
            }
            !self.stop
        }

        async fn handle_response(
            &self,
            _ctx: &RequestContext,
            _res: &mut ServerResponse,
            shared: &mut SharedState,
        ) {
            assert_eq!(shared.get::<usize>(&self.name), Some(&self.name.len()));
            self.journal.lock().push(format!("res:{}", self.name));
        }
    }

    struct Echo(Journal);

    #[async_trait]
    impl Terminal for Echo {
        async fn handle(&self, _ctx: &RequestContext, _req: &mut ServerRequest, res: &mut ServerResponse) {
            self.0.lock().push("terminal".into());
            res.write_json(200, None, &json!({}));
        }
    }

    fn node(name: &str, stop: bool, journal: &Journal) -> Arc<dyn StackNode> {
        Arc::new(Recorder {
            name: name.to_string(),
            stop,
            journal: journal.clone(),
        })
    }

    async fn run(stack: &ExecutionStack) -> ServerResponse {
        let ctx = RequestContext::background();
        let mut req = ServerRequest::rpc("A::b", Headers::new(), Bytes::new());
        let mut res = ServerResponse::new(Protocol::Rpc);
        stack.run(&ctx, &mut req, &mut res).await;
        res
    }

    #[tokio::test]
    async fn full_pass_visits_every_node_in_reverse() {
        let journal: Journal = Arc::default();
        let stack = ExecutionStack::new(
            vec![node("adapter", false, &journal)],
            vec![node("one", false, &journal), node("two", false, &journal)],
            Arc::new(Echo(journal.clone())),
        );
        let res = run(&stack).await;
        assert_eq!(res.status(), Some(200));
        assert_eq!(
            *journal.lock(),
            vec![
                "req:adapter", "req:one", "req:two", "terminal", "res:two", "res:one",
                "res:adapter"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_unwinds_only_nodes_that_ran() {
        let journal: Journal = Arc::default();
        let stack = ExecutionStack::new(
            Vec::new(),
            vec![
                node("one", false, &journal),
                node("two", true, &journal),
                node("three", false, &journal),
            ],
            Arc::new(Echo(journal.clone())),
        );
        let res = run(&stack).await;
        assert_eq!(res.status(), Some(403));
        assert_eq!(
            *journal.lock(),
            vec!["req:one", "req:two", "res:two", "res:one"]
        );
    }

    #[tokio::test]
    async fn pre_and_post_counts_balance() {
        let journal: Journal = Arc::default();
        let stack = ExecutionStack::new(
            Vec::new(),
            vec![node("a", false, &journal), node("b", true, &journal), node("c", false, &journal)],
            Arc::new(Echo(journal.clone())),
        );
        for _ in 0..3 {
            run(&stack).await;
        }
        let entries = journal.lock().clone();
        for name in ["a", "b", "c"] {
            let pre = entries.iter().filter(|e| **e == format!("req:{name}")).count();
            let post = entries.iter().filter(|e| **e == format!("res:{name}")).count();
            assert_eq!(pre, post, "node {name}");
        }
    }

    #[test]
    fn shared_state_is_seeded_per_node() {
        let mut state = SharedState::for_nodes(["x", "y"]);
        assert!(state.has_slot("x"));
        assert!(state.get::<u32>("x").is_none());
        state.insert("x", 5u32);
        *state.get_mut::<u32>("x").unwrap() += 1;
        assert_eq!(state.get::<u32>("x"), Some(&6));
        assert!(state.get::<String>("x").is_none());
    }
}
