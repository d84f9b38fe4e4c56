//! The deduplicated agent list shown to remote clients.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use libptyhub::{AgentDirectory, SessionPool};
use ptyhub_protocol::{AgentRunState, RemoteAgent, TaskId};

/// Build the remote agent list: one entry per task id, where a running
/// agent outranks an exited one and the last-seen agent wins ties.
pub async fn build_agent_list(pool: &SessionPool, directory: &dyn AgentDirectory) -> Vec<RemoteAgent> {
    let mut by_task: HashMap<TaskId, RemoteAgent> = HashMap::new();
    let mut task_order: Vec<TaskId> = Vec::new();

    for agent_id in pool.active_ids().await {
        let Some(meta) = pool.meta(&agent_id).await else {
            // The agent exited between the id listing and the meta lookup.
            continue;
        };
        let status = directory.agent_status(&agent_id);
        let entry = RemoteAgent {
            agent_id,
            task_id: meta.task_id.clone(),
            task_name: directory.task_name(&meta.task_id),
            status: status.state,
            exit_code: status.exit_code,
            last_line: status.last_line,
        };

        match by_task.entry(meta.task_id) {
            Entry::Vacant(slot) => {
                task_order.push(slot.key().clone());
                slot.insert(entry);
            }
            Entry::Occupied(mut slot) => {
                let keep_existing = slot.get().status == AgentRunState::Running
                    && entry.status != AgentRunState::Running;
                if !keep_existing {
                    slot.insert(entry);
                }
            }
        }
    }

    task_order
        .into_iter()
        .filter_map(|task_id| by_task.remove(&task_id))
        .collect()
}
