//! Runs the real tool and bundler adapters against small shell scripts.
#![cfg(unix)]

mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bouncer_worker::{
    models::{
        job::{Durability, ImportOutcome, Job},
        message::{InboundMessage, JobSource},
    },
    services::{
        bundle::{AssetBundler, BundleError, BundleSettings, ScriptBundler},
        tool::{BouncerTool, ConversionTool, ExitCodeTable, ToolError, ToolSettings},
    },
};
use helpers::conversion_message;
use tempfile::TempDir;

const SHELL: &str = "/bin/sh";

/// The tool is invoked as `<binary> <source> <outputDir> ...`; using the shell
/// as the binary makes the source reference a script with `$1` as output dir.
fn tool(work_dir: &Path, timeout: Duration) -> BouncerTool {
    BouncerTool::new(ToolSettings {
        binary: PathBuf::from(SHELL),
        work_dir: work_dir.join("work"),
        log_dir: work_dir.join("logs"),
        db_host: "db.internal".into(),
        db_port: 5432,
        db_user: "bouncer".into(),
        db_password: "s3cret".into(),
        timeout,
        exit_codes: ExitCodeTable::new(vec![75], None),
    })
}

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path.display().to_string()
}

fn job_for(source: &str) -> Job {
    InboundMessage::parse(&conversion_message("J1", source), JobSource::Task).unwrap()
}

#[tokio::test]
async fn test_successful_run_collects_artifacts() {
    let dir = TempDir::new().unwrap();
    let source = script(
        dir.path(),
        "ok.sh",
        "echo converting\ntouch \"$1/model.glb\" \"$1/model.json\"\nexit 0\n",
    );
    let tool = tool(dir.path(), Duration::from_secs(10));

    let result = tool.convert(&job_for(&source)).await.unwrap();

    assert_eq!(result.job_id, "J1");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output_dir, dir.path().join("work").join("J1"));
    let names: Vec<_> = result
        .artifacts
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["model.glb", "model.json"]);
    assert!(result.log_excerpt.contains("converting"));
}

#[tokio::test]
async fn test_each_attempt_starts_with_empty_output_dir() {
    let dir = TempDir::new().unwrap();
    let stale_dir = dir.path().join("work").join("J1");
    std::fs::create_dir_all(&stale_dir).unwrap();
    std::fs::write(stale_dir.join("partial.glb"), b"from a failed attempt").unwrap();
    let source = script(dir.path(), "ok.sh", "touch \"$1/model.glb\"\n");
    let tool = tool(dir.path(), Duration::from_secs(10));

    let result = tool.convert(&job_for(&source)).await.unwrap();

    assert_eq!(result.artifacts, vec![stale_dir.join("model.glb")]);
}

#[tokio::test]
async fn test_verbose_tool_output_does_not_break_conversion() {
    let dir = TempDir::new().unwrap();
    // Roughly 6 MiB on stdout before a clean exit.
    let source = script(
        dir.path(),
        "chatty.sh",
        "yes 'progress: meshing tile' | head -c 6291456\necho done\ntouch \"$1/model.glb\"\nexit 0\n",
    );
    let tool = tool(dir.path(), Duration::from_secs(60));

    let result = tool.convert(&job_for(&source)).await.unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.artifacts.len(), 1);
    assert!(result.log_excerpt.contains("done"));
}

#[tokio::test]
async fn test_credentials_are_passed_through_environment() {
    let dir = TempDir::new().unwrap();
    let source = script(
        dir.path(),
        "env.sh",
        "printf '%s' \"$BOUNCER_DB_PASSWORD\" > \"$1/password\"\nprintf '%s' \"$3 $5\" > \"$1/args\"\n",
    );
    let tool = tool(dir.path(), Duration::from_secs(10));

    let result = tool.convert(&job_for(&source)).await.unwrap();

    let password = std::fs::read_to_string(result.output_dir.join("password")).unwrap();
    assert_eq!(password, "s3cret");
    let args = std::fs::read_to_string(result.output_dir.join("args")).unwrap();
    assert_eq!(args, "db.internal 5432");
}

#[tokio::test]
async fn test_transient_exit_code() {
    let dir = TempDir::new().unwrap();
    let source = script(dir.path(), "busy.sh", "echo 'licence busy' >&2\nexit 75\n");
    let tool = tool(dir.path(), Duration::from_secs(10));

    let err = tool.convert(&job_for(&source)).await.unwrap_err();

    assert!(err.is_transient());
    assert!(matches!(err, ToolError::Transient { code: Some(75), .. }));
    assert!(err.detail().contains("licence busy"));
}

#[tokio::test]
async fn test_fatal_exit_code_carries_diagnostics() {
    let dir = TempDir::new().unwrap();
    let source = script(
        dir.path(),
        "bad.sh",
        "echo 'unsupported schema IFC2X2' >&2\nexit 3\n",
    );
    let tool = tool(dir.path(), Duration::from_secs(10));

    let err = tool.convert(&job_for(&source)).await.unwrap_err();

    assert!(!err.is_transient());
    assert!(matches!(err, ToolError::Fatal { code: Some(3), .. }));
    assert!(err.detail().contains("unsupported schema IFC2X2"));
}

#[tokio::test]
async fn test_hung_tool_is_killed_at_timeout() {
    let dir = TempDir::new().unwrap();
    let source = script(dir.path(), "hang.sh", "exec sleep 30\n");
    let tool = tool(dir.path(), Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = tool.convert(&job_for(&source)).await.unwrap_err();

    assert!(matches!(err, ToolError::Timeout(_)));
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_missing_binary_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let settings = ToolSettings {
        binary: dir.path().join("does-not-exist"),
        work_dir: dir.path().join("work"),
        log_dir: dir.path().join("logs"),
        db_host: "localhost".into(),
        db_port: 5432,
        db_user: "bouncer".into(),
        db_password: String::new(),
        timeout: Duration::from_secs(5),
        exit_codes: ExitCodeTable::default(),
    };

    let err = BouncerTool::new(settings)
        .convert(&job_for("a.ifc"))
        .await
        .unwrap_err();

    assert!(matches!(err, ToolError::Launch(_)));
    assert!(!err.is_transient());
}

fn import_for(asset_dir: &Path) -> ImportOutcome {
    ImportOutcome {
        job_id: "J1".into(),
        durability: Durability::Local,
        artifact_count: 1,
        asset_dir: asset_dir.to_path_buf(),
        inserted: true,
    }
}

#[tokio::test]
async fn test_bundler_collects_bundles() {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let build = script(
        dir.path(),
        "bundle.sh",
        "mkdir -p bundles\ntouch bundles/model.unity3d\n",
    );
    let bundler = ScriptBundler::new(BundleSettings {
        tool: Some(PathBuf::from(SHELL)),
        script: Some(PathBuf::from(build)),
        timeout: Duration::from_secs(10),
    });

    let outcome = bundler
        .bundle(&job_for("a.ifc"), &import_for(&assets))
        .await
        .unwrap();

    assert_eq!(outcome.bundles, vec![assets.join("bundles").join("model.unity3d")]);
}

#[tokio::test]
async fn test_bundler_failure_reports_exit_code() {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let build = script(dir.path(), "fail.sh", "echo 'no licence' >&2\nexit 2\n");
    let bundler = ScriptBundler::new(BundleSettings {
        tool: Some(PathBuf::from(SHELL)),
        script: Some(PathBuf::from(build)),
        timeout: Duration::from_secs(10),
    });

    let err = bundler
        .bundle(&job_for("a.ifc"), &import_for(&assets))
        .await
        .unwrap_err();

    assert!(matches!(err, BundleError::Failed { code: Some(2), .. }));
    assert!(err.detail().contains("no licence"));
}

#[tokio::test]
async fn test_unconfigured_bundler() {
    let dir = TempDir::new().unwrap();
    let bundler = ScriptBundler::new(BundleSettings {
        tool: None,
        script: None,
        timeout: Duration::from_secs(10),
    });

    let err = bundler
        .bundle(&job_for("a.ifc"), &import_for(dir.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, BundleError::NotConfigured));
}
