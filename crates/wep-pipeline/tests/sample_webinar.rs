use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use wep_core::{Table, TableError};
use wep_pipeline::{report_runs_markdown, Pipeline, PipelineConfig, RunPaths};
use wep_tabular::{read_table, sha256_hex};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-webinar")
}

fn staged_inputs() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for entry in fs::read_dir(fixture_dir()).expect("fixture dir") {
        let entry = entry.expect("fixture entry");
        fs::copy(entry.path(), dir.path().join(entry.file_name())).expect("copy fixture");
    }
    dir
}

fn run(input: &Path, output: &Path) -> anyhow::Result<wep_pipeline::RunSummary> {
    Pipeline::new(PipelineConfig::default(), RunPaths::new(input, output))?.run_once()
}

fn column(table: &Table, name: &str) -> Vec<String> {
    table.records().map(|r| r.value(name).to_string()).collect()
}

#[test]
fn sample_webinar_produces_enriched_import() {
    let input = staged_inputs();
    let output = tempfile::tempdir().expect("tempdir");
    let summary = run(input.path(), output.path()).expect("pipeline run");

    let enriched = read_table(output.path().join("webinar_clay_import.csv"), 0).unwrap();
    assert_eq!(summary.enriched_rows, 5);
    assert_eq!(column(&enriched, "BMID"), ["B001", "B002", "B003", "B004", "B006"]);
    assert_eq!(
        column(&enriched, "attendance_status"),
        ["attended", "did_not_attend", "attended", "registered_only", "registered_only"]
    );
    assert_eq!(column(&enriched, "poll_responses"), ["2", "0", "1", "0", "0"]);
    assert_eq!(column(&enriched, "emoji_reactions"), ["4", "0", "2", "0", "0"]);
    assert_eq!(column(&enriched, "qa_questions"), ["0", "0", "2", "1", "0"]);
    assert_eq!(column(&enriched, "company_name"), ["Acme", "", "Wei Corp", "", ""]);
    assert_eq!(column(&enriched, "LinkedIn URL")[1], "");
    assert_eq!(column(&enriched, "Job Title")[4], "Head of Growth");

    let join = summary.crm_join().expect("crm join stats");
    assert_eq!(join.matched, 2);
    assert_eq!(join.empty_primary_keys, 2);

    let registrants = &summary.sheets[0];
    assert_eq!(registrants.clean.rows_in, 8);
    assert_eq!(registrants.clean.dropped_missing_key, 1);
    assert_eq!(registrants.clean.dropped_missing_fields, 1);
    assert_eq!(registrants.dedup.rows_removed(), 1);
}

#[test]
fn cleaned_sheets_and_reports_are_written_with_manifest() {
    let input = staged_inputs();
    let output = tempfile::tempdir().expect("tempdir");
    let summary = run(input.path(), output.path()).expect("pipeline run");

    let cleaned_qa = read_table(output.path().join("cleaned").join("Q&A.csv"), 0).unwrap();
    assert_eq!(
        cleaned_qa.record(0).unwrap().value("Question"),
        "How do you route leads across regions?"
    );
    let cleaned_emoji = read_table(output.path().join("cleaned").join("emoji eeaction.csv"), 0).unwrap();
    assert!(cleaned_emoji.records().all(|r| r.value("BMID") != "B006"));

    let reports = PathBuf::from(&summary.reports_dir);
    assert!(reports.join("summary.md").is_file());
    let markdown = fs::read_to_string(reports.join("summary.md")).unwrap();
    assert!(markdown.contains("matched: 2 of 5"));

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(reports.join("manifest.json")).unwrap()).unwrap();
    let files = manifest["files"].as_array().expect("files array");
    let enriched = files
        .iter()
        .find(|f| f["name"] == "enriched")
        .expect("enriched entry");
    let bytes = fs::read(output.path().join("webinar_clay_import.csv")).unwrap();
    assert_eq!(enriched["sha256"], sha256_hex(&bytes));
    assert_eq!(enriched["bytes"], bytes.len() as u64);
    assert!(files.iter().any(|f| f["name"] == "run_summary"));

    let digest = report_runs_markdown(output.path(), 5).unwrap();
    assert!(digest.contains(&summary.run_id.to_string()));
    let none = report_runs_markdown(output.path(), 0).unwrap();
    assert!(!none.contains(&summary.run_id.to_string()));
}

#[test]
fn missing_interaction_log_yields_zero_counts() {
    let input = staged_inputs();
    fs::remove_file(input.path().join("Q&A.csv")).unwrap();
    fs::remove_file(input.path().join("did not attend list.csv")).unwrap();
    let output = tempfile::tempdir().expect("tempdir");
    run(input.path(), output.path()).expect("pipeline run");

    let enriched = read_table(output.path().join("webinar_clay_import.csv"), 0).unwrap();
    assert!(column(&enriched, "qa_questions").iter().all(|v| v == "0"));
    assert_eq!(column(&enriched, "attendance_status")[1], "registered_only");
}

#[test]
fn missing_crm_export_fails_without_writing_output() {
    let input = staged_inputs();
    fs::remove_file(input.path().join("CRM.csv")).unwrap();
    let output = tempfile::tempdir().expect("tempdir");

    let err = run(input.path(), output.path()).unwrap_err();
    match err.downcast_ref::<TableError>() {
        Some(TableError::MissingRequiredInput { role, .. }) => assert_eq!(role, "crm"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!output.path().join("webinar_clay_import.csv").exists());
}

#[test]
fn truncated_registrant_export_is_malformed() {
    let input = staged_inputs();
    fs::write(input.path().join("registered list.csv"), "Attendee Report\nonly metadata\n").unwrap();
    let output = tempfile::tempdir().expect("tempdir");

    let err = run(input.path(), output.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TableError>(),
        Some(TableError::MalformedTable { .. })
    ));
}

#[test]
fn skip_counts_come_from_configuration() {
    let input = staged_inputs();
    let text = fs::read_to_string(input.path().join("attend list.csv")).unwrap();
    fs::write(
        input.path().join("attend list.csv"),
        format!("Exported by\nAttendee Details\n{}", text.split_once('\n').unwrap().1),
    )
    .unwrap();

    let mut config = PipelineConfig::default();
    config
        .sheets
        .iter_mut()
        .find(|s| s.file_name == "attend list.csv")
        .unwrap()
        .skip_lines = 2;
    let output = tempfile::tempdir().expect("tempdir");
    Pipeline::new(config, RunPaths::new(input.path(), output.path()))
        .unwrap()
        .run_once()
        .unwrap();

    let enriched = read_table(output.path().join("webinar_clay_import.csv"), 0).unwrap();
    assert_eq!(column(&enriched, "attendance_status")[0], "attended");
}
