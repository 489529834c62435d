use std::fmt::Write as _;

use rampart_state::Rollout;

use super::Context;

pub fn status(ctx: &Context, id: Option<&str>, format: &str) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let rollouts = match id {
        Some(id) => vec![
            store
                .get_rollout(id)?
                .ok_or_else(|| anyhow::anyhow!("rollout {id} not found"))?,
        ],
        None => store.list_rollouts()?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rollouts)?),
        _ => print!("{}", format_summary(&rollouts)),
    }
    Ok(())
}

pub fn history(ctx: &Context, id: &str, format: &str) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let rollout = store
        .get_rollout(id)?
        .ok_or_else(|| anyhow::anyhow!("rollout {id} not found"))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(rollout.history())?),
        _ => print!("{}", format_history(&rollout)),
    }
    Ok(())
}

/// One row per rollout.
pub fn format_summary(rollouts: &[Rollout]) -> String {
    if rollouts.is_empty() {
        return "no rollouts\n".to_string();
    }

    let mut out = format!(
        "{:<32} {:<12} {:>5} {:>6}  {}\n",
        "ID", "STATUS", "STAGE", "WEIGHT", "VARIANTS"
    );
    for r in rollouts {
        let _ = write!(
            out,
            "{:<32} {:<12} {:>5} {:>5}%  {} → {}",
            r.id,
            r.status.as_str(),
            format!("{}/{}", r.current_stage_index + 1, r.catalog.len()),
            r.last_applied_weight_percent,
            r.stable_variant,
            r.candidate_variant,
        );
        if let Some(reason) = &r.abort_requested {
            let _ = write!(out, "  (abort requested: {reason})");
        }
        out.push('\n');
    }
    out
}

pub fn format_history(rollout: &Rollout) -> String {
    let mut out = format!("{} ({})\n", rollout.id, rollout.status);
    for entry in rollout.history() {
        let change = if entry.from == entry.to {
            entry.to.to_string()
        } else {
            format!("{} → {}", entry.from, entry.to)
        };
        let _ = writeln!(
            out,
            "  {}  stage {} @ {:>3}%  {:<26} {}",
            entry.at, entry.stage_index, entry.weight_percent, change, entry.reason
        );
    }
    out
}
