use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use kumiki::{CommandEngine, Outcome, PIPELINE_FILE, PipelineSpec, SkipReason};

fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn touch(dir: &Utf8Path, name: &str, text: &str) {
    fs::write(dir.join(name), text).unwrap();
}

#[test]
fn shell_pipeline_builds_incrementally() {
    let (_guard, dir) = tempdir();

    touch(&dir, "load.sh", "echo \"$KUMIKI_PARAM_GREETING\" > \"$KUMIKI_PRODUCT\"\n");
    touch(
        &dir,
        "shout.sh",
        "tr a-z A-Z < \"$KUMIKI_UPSTREAM_LOAD\" > \"$KUMIKI_PRODUCT\"\n",
    );
    touch(
        &dir,
        PIPELINE_FILE,
        r#"{
            "executor": "parallel",
            "tasks": [
                { "source": "load.sh", "product": "out/load.txt", "params": { "greeting": "{{greeting}}" } },
                { "source": "shout.sh", "product": "out/shout.txt", "upstream": ["load"] }
            ]
        }"#,
    );
    touch(&dir, "env.json", r#"{ "greeting": "hello" }"#);
    fs::create_dir(dir.join("out")).unwrap();

    let spec = PipelineSpec::find(&dir).unwrap();
    let mut graph = spec.to_graph(Arc::new(CommandEngine::new())).unwrap();

    let report = graph.build(false).unwrap();
    assert_eq!(report.outcome("shout"), Some(Outcome::Built));
    assert_eq!(fs::read_to_string(dir.join("out/shout.txt")).unwrap(), "HELLO\n");

    let report = graph.build(false).unwrap();
    assert_eq!(
        report.outcome("shout"),
        Some(Outcome::Skipped(SkipReason::UpToDate))
    );

    // a new graph reads the stored build records
    let mut graph = spec.to_graph(Arc::new(CommandEngine::new())).unwrap();
    let report = graph.build(false).unwrap();
    assert_eq!(report.ran().count(), 0);
}

#[test]
fn failing_shell_task_reports_stderr() {
    let (_guard, dir) = tempdir();

    touch(&dir, "fail.sh", "echo 'no such table' >&2\nexit 3\n");
    touch(
        &dir,
        PIPELINE_FILE,
        r#"{ "tasks": [{ "source": "fail.sh", "product": "fail.txt" }] }"#,
    );

    let spec = PipelineSpec::load(dir.join(PIPELINE_FILE)).unwrap();
    let mut graph = spec.to_graph(Arc::new(CommandEngine::new())).unwrap();

    let err = graph.build(false).unwrap_err();
    assert!(err.failure("fail").unwrap().to_string().contains("no such table"));
}
