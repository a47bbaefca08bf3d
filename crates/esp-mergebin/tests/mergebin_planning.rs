use std::path::PathBuf;

use esp_mergebin::config::ConfigDoc;

fn plan_for(src: &str) -> esp_mergebin::Result<esp_mergebin::planner::Plan> {
    let doc = ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(src).unwrap(),
    };
    esp_mergebin::modules::plan_all(&doc)
}

fn order(plan: &esp_mergebin::planner::Plan) -> Vec<String> {
    plan.ordered()
        .unwrap()
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

#[test]
fn empty_config_plans_mergebin_after_firmware() {
    let plan = plan_for("").unwrap();
    assert_eq!(
        order(&plan),
        ["core.init", "firmware.build", "mergebin.merge"]
    );

    let merge = plan.get("mergebin.merge").unwrap();
    assert_eq!(merge.label, "Merge binary");
    assert_eq!(merge.description.as_deref(), Some("Build combined image"));
    assert_eq!(merge.after, ["artifact:firmware"]);
}

#[test]
fn mergebin_target_selects_its_dependency_chain() {
    let plan = plan_for("").unwrap();
    let mut targets = plan.targets();
    targets.sort();
    assert_eq!(targets, ["firmware", "mergebin"]);

    let sel = plan.select("mergebin").unwrap();
    assert_eq!(order(&sel), ["core.init", "firmware.build", "mergebin.merge"]);

    let sel = plan.select("firmware").unwrap();
    assert_eq!(order(&sel), ["core.init", "firmware.build"]);
}

#[test]
fn disabled_mergebin_is_not_planned() {
    let plan = plan_for(
        r#"
[mergebin]
enabled = false
"#,
    )
    .unwrap();
    assert!(plan.get("mergebin.merge").is_none());
    let err = plan.select("mergebin").unwrap_err().to_string();
    assert!(err.contains("unknown target"), "unexpected err: {err}");
}

#[test]
fn labels_come_from_config() {
    let plan = plan_for(
        r#"
[firmware]
label = "pio run"

[mergebin]
label = "Build combined image"
description = "Firmware, bootloader and partitions in one file"
"#,
    )
    .unwrap();
    assert_eq!(plan.get("firmware.build").unwrap().label, "pio run");
    assert_eq!(
        plan.get("mergebin.merge").unwrap().label,
        "Build combined image"
    );
    assert_eq!(
        plan.get("mergebin.merge").unwrap().description.as_deref(),
        Some("Firmware, bootloader and partitions in one file")
    );
}

#[test]
fn rejects_unknown_table() {
    let err = plan_for(
        r#"
[upload]
port = "/dev/ttyUSB0"
"#,
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("upload"), "unexpected err: {err}");
}

#[test]
fn rejects_build_command_without_program() {
    let err = plan_for(
        r#"
[firmware]
build_command = ["", "run"]
"#,
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("empty program"), "unexpected err: {err}");
}
