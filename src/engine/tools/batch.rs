// Paw Agent Engine — Batch dispatch
// Runs the tool calls of one model turn concurrently. Results come back in
// request order, each tagged with the caller's call id, whatever order the
// calls finish in.

use super::ToolRegistry;
use crate::atoms::types::{ToolCallOutcome, ToolCallRequest};
use futures::future::join_all;
use log::info;
use tokio::time::Instant;

impl ToolRegistry {
    pub async fn dispatch_batch(&self, calls: Vec<ToolCallRequest>, deadline: Instant) -> Vec<ToolCallOutcome> {
        if calls.is_empty() {
            return Vec::new();
        }
        info!("[tools] Batch of {} call(s)", calls.len());
        let runs = calls.into_iter().map(|call| async move {
            let result = self.dispatch(&call.name, &call.arguments, deadline).await;
            ToolCallOutcome { call_id: call.call_id, name: call.name, result }
        });
        join_all(runs).await
    }
}
