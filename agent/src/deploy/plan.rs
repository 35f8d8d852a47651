//! Deploy plan comparison

use crate::models::ping::PingResponse;

/// Whether the server moved to a different plan between two responses.
///
/// A plan is identified by the opcode plus the deploy id and stage of its
/// goal. A missing response on exactly one side counts as a change.
pub fn plan_changed(old: Option<&PingResponse>, new: Option<&PingResponse>) -> bool {
    let (old, new) = match (old, new) {
        (None, None) => return false,
        (Some(old), Some(new)) => (old, new),
        _ => return true,
    };

    if old.op_code != new.op_code {
        return true;
    }

    match (old.deploy_goal.as_ref(), new.deploy_goal.as_ref()) {
        (None, None) => false,
        (Some(old_goal), Some(new_goal)) => {
            old_goal.deploy_id != new_goal.deploy_id
                || old_goal.deploy_stage != new_goal.deploy_stage
        }
        _ => true,
    }
}
