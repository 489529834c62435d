use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context as _;
use tracing::info;

use rampart_core::{RolloutPlan, StageCatalog};
use rampart_rollout::prepare_rollout;
use rampart_state::Rollout;

use super::{Context, now};

pub fn validate(ctx: &Context, plan_path: &Path) -> anyhow::Result<()> {
    let plan = RolloutPlan::from_file(plan_path)?;
    let rollout = check(ctx, &plan, "validate")?;

    println!(
        "✓ {} is valid ({} → {})",
        plan_path.display(),
        plan.stable,
        plan.candidate
    );
    print!("{}", describe_stages(&rollout.catalog));
    println!("{}", describe_gates(&rollout.catalog));
    Ok(())
}

pub fn start(ctx: &Context, plan_path: &Path, id: Option<&str>) -> anyhow::Result<()> {
    let plan = RolloutPlan::from_file(plan_path)?;
    let id = match id {
        Some(id) => id.to_string(),
        None => format!("{}-{}", plan.candidate, now()),
    };
    let rollout = check(ctx, &plan, &id)?;

    let store = ctx.open_store()?;
    store.insert_rollout(&rollout)?;
    info!(rollout = %id, stages = rollout.catalog.len(), "rollout created");

    println!("{id}");
    Ok(())
}

fn check(ctx: &Context, plan: &RolloutPlan, id: &str) -> anyhow::Result<Rollout> {
    prepare_rollout(
        id,
        &plan.stable,
        &plan.candidate,
        plan.catalog(),
        ctx.config.tick_interval_secs,
        now(),
    )
    .with_context(|| format!("plan {} → {} rejected", plan.stable, plan.candidate))
}

/// One line per stage: weight, soak, and thresholds.
pub fn describe_stages(catalog: &StageCatalog) -> String {
    let mut out = String::new();
    for stage in catalog.stages() {
        let _ = write!(
            out,
            "  stage {}: {:>3}% for {}s",
            stage.index, stage.target_weight_percent, stage.min_soak_secs
        );
        for (metric, threshold) in &stage.thresholds {
            let _ = write!(out, "  {metric} {} {}", threshold.op, threshold.limit);
        }
        out.push('\n');
    }
    out
}

/// The metrics a source must supply for this catalog.
pub fn describe_gates(catalog: &StageCatalog) -> String {
    let names = catalog.metric_names();
    if names.is_empty() {
        "  no metric gates; stages advance on soak time alone".to_string()
    } else {
        format!("  gated on: {}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::ControllerConfig;
    use rampart_state::RolloutStatus;

    const PLAN: &str = r#"
stable = "api-blue"
candidate = "api-green"

[[stages]]
weight = 10
min_soak_secs = 60
thresholds.error_rate = { op = "<=", limit = 0.01 }

[[stages]]
weight = 100
min_soak_secs = 120
"#;

    fn context(dir: &Path) -> Context {
        Context {
            data_dir: dir.join("data"),
            config: ControllerConfig::default(),
        }
    }

    fn write_plan(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("plan.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn validate_accepts_good_plan() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        validate(&ctx, &write_plan(dir.path(), PLAN)).unwrap();
        assert!(!ctx.data_dir.exists());
    }

    #[test]
    fn validate_rejects_final_weight_below_100() {
        let dir = tempfile::tempdir().unwrap();
        let plan = PLAN.replace("weight = 100", "weight = 90");
        let err = validate(&context(dir.path()), &write_plan(dir.path(), &plan)).unwrap_err();
        assert!(format!("{err:#}").contains("100"));
    }

    #[test]
    fn validate_rejects_slow_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.config.tick_interval_secs = 60;
        assert!(validate(&ctx, &write_plan(dir.path(), PLAN)).is_err());
    }

    #[test]
    fn start_persists_pending_rollout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let plan = write_plan(dir.path(), PLAN);

        start(&ctx, &plan, Some("canary-1")).unwrap();
        assert!(start(&ctx, &plan, Some("canary-1")).is_err());

        let stored = ctx.open_store().unwrap().get_rollout("canary-1").unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::Pending);
        assert_eq!(stored.candidate_variant, "api-green");
        assert_eq!(stored.catalog.len(), 2);
    }

    #[test]
    fn stage_description_lists_thresholds() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        let text = describe_stages(&plan.catalog());
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("stage 0:  10% for 60s  error_rate <= 0.01"));
    }

    #[test]
    fn gate_summary_lists_required_metrics() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        assert_eq!(describe_gates(&plan.catalog()), "  gated on: error_rate");

        let ungated = RolloutPlan::from_toml_str(
            "stable = \"a\"\ncandidate = \"b\"\n[[stages]]\nweight = 100\nmin_soak_secs = 30\n",
        )
        .unwrap();
        assert!(describe_gates(&ungated.catalog()).contains("no metric gates"));
    }
}
