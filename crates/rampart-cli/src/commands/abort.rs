use rampart_rollout::request_abort;

use super::{Context, now};

pub fn abort(ctx: &Context, id: &str, reason: &str) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let rollout = request_abort(&store, id, reason, now())?;
    println!(
        "✓ abort recorded for {} ({}); traffic returns to {} on the next tick",
        rollout.id, rollout.status, rollout.stable_variant
    );
    Ok(())
}
