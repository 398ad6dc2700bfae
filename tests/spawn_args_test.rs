//! Locks down the agent's command line.
//!
//! The external CLI is picky about argument order and about `--print`
//! never appearing together with `--resume`; these snapshots catch
//! accidental reorderings.

use std::path::PathBuf;

use familiar::resume::SpawnPlan;
use familiar::session::record::ResumeId;

fn rendered(plan: &SpawnPlan) -> String {
    plan.to_args().join("\n")
}

#[test]
fn fresh_send_arguments() {
    let plan = SpawnPlan {
        prompt: "explain the build error".to_string(),
        resume: None,
        model: Some("sonnet".to_string()),
        append_system_prompt: Some("stay terse".to_string()),
        working_directory: PathBuf::from("/home/dev/project"),
    };
    insta::with_settings!({
        snapshot_path => "../tests/cases",
        prepend_module_to_snapshot => false,
    }, {
        insta::assert_snapshot!("fresh_send_arguments", rendered(&plan));
    });
}

#[test]
fn resumed_send_arguments() {
    let plan = SpawnPlan {
        prompt: "continue the refactor".to_string(),
        resume: Some(ResumeId::new("agent-12f")),
        model: None,
        append_system_prompt: None,
        working_directory: PathBuf::from("/home/dev/project"),
    };
    insta::with_settings!({
        snapshot_path => "../tests/cases",
        prepend_module_to_snapshot => false,
    }, {
        insta::assert_snapshot!("resumed_send_arguments", rendered(&plan));
    });
}

#[test]
fn summarize_arguments() {
    let plan = SpawnPlan {
        prompt: "/compact".to_string(),
        resume: Some(ResumeId::new("agent-12f")),
        model: Some("sonnet".to_string()),
        append_system_prompt: None,
        working_directory: PathBuf::from("/home/dev/project"),
    };
    insta::with_settings!({
        snapshot_path => "../tests/cases",
        prepend_module_to_snapshot => false,
    }, {
        insta::assert_snapshot!("summarize_arguments", rendered(&plan));
    });
}
