use super::state::VertexState;
use super::{Owner, SolverInner};
use crate::context::Context;
use crate::errors::Result;
use crate::vertex::{Builder, CachedResult, Edge};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// Builder handed to a running vertex. Vertices it builds become children
/// of that vertex and stay active as long as it does.
pub(crate) struct SubBuilder {
    solver: Arc<SolverInner>,
    parent: Arc<VertexState>,
    /// Execution slot of the parent, given up on the first sub-build so
    /// nested executions cannot starve on the limit
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl SubBuilder {
    pub(crate) fn new(
        solver: Arc<SolverInner>,
        parent: Arc<VertexState>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            solver,
            parent,
            permit: Mutex::new(permit),
        }
    }
}

#[async_trait]
impl Builder for SubBuilder {
    async fn build(&self, ctx: &Context, edge: Edge) -> Result<CachedResult> {
        drop(self.permit.lock().take());
        let state = self
            .solver
            .load(&edge.vertex, Owner::Parent(self.parent.clone()))?;
        tracing::debug!(parent = %self.parent.name, vertex = %state.name, "sub-build");
        state.edge_result(&self.solver, ctx, edge.index).await
    }
}
