use std::time::{Duration, Instant};

use linuxdiag_exec::*;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .unwrap()
        .success()
}

fn dispatcher() -> Dispatcher {
    let config = ExecConfig {
        backend: BackendKind::InProcess,
        search_identity: false,
        ..ExecConfig::default()
    };
    Dispatcher::from_config(&config).unwrap()
}

#[tokio::test]
async fn echo_runs_locally() {
    let result = dispatcher()
        .execute(&argv(&["echo", "hi"]), None)
        .await
        .unwrap();

    assert_eq!(result.status, 0);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
}

#[tokio::test]
async fn missing_primary_falls_back() {
    let spec = CommandSpec::new(["ss-not-installed-here", "-tunap"]).with_fallback(["echo", "netstat"]);

    let result = dispatcher().run_spec(&spec, None).await.unwrap();

    assert_eq!(result.stdout, "netstat\n");
}

#[tokio::test]
async fn failing_primary_falls_back_once() {
    let fallback = argv(&["sh", "-c", "echo fallback; exit 2"]);

    let result = dispatcher()
        .execute_with_fallback(&argv(&["false"]), Some(fallback.as_slice()), None)
        .await
        .unwrap();

    // fallback result is returned even though it failed too
    assert_eq!(result.status, 2);
    assert_eq!(result.stdout, "fallback\n");
}

#[tokio::test]
async fn successful_primary_skips_fallback() {
    let fallback = argv(&["sh", "-c", "echo should-not-run"]);

    let result = dispatcher()
        .execute_with_fallback(&argv(&["echo", "primary"]), Some(fallback.as_slice()), None)
        .await
        .unwrap();

    assert_eq!(result.stdout, "primary\n");
}

#[tokio::test]
async fn failing_primary_without_fallback_is_returned() {
    let result = dispatcher()
        .execute_with_fallback(&argv(&["sh", "-c", "echo bad >&2; exit 4"]), None, None)
        .await
        .unwrap();

    assert_eq!(result.status, 4);
    assert_eq!(result.stderr, "bad\n");
}

#[tokio::test]
async fn local_timeout_is_an_error_not_a_connection_error() {
    let options = ExecOptions {
        timeout: Some(Duration::from_millis(200)),
        encoding: Encoding::Utf8,
    };

    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("child.pid");
    let script = format!("echo $$ > {}; exec sleep 10", pid_file.display());

    let start = Instant::now();
    let err = dispatcher()
        .execute_with_options(&argv(&["sh", "-c", &script]), None, options)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Timeout { host: None, .. }));
    assert!(!err.is_connection_error());
    assert!(err.to_string().contains("localhost"));
    assert!(start.elapsed() < Duration::from_secs(5));

    // killed and reaped, not left running in the background
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(!process_alive(pid.trim()));
}

#[tokio::test]
async fn raw_encoding_keeps_bytes() {
    let options = ExecOptions {
        timeout: None,
        encoding: Encoding::Raw,
    };

    let result = dispatcher()
        .execute_with_options(&argv(&["printf", "\\377\\n"]), None, options)
        .await
        .unwrap();

    assert_eq!(result.stdout.as_bytes(), [0xff, b'\n']);
}

#[tokio::test]
async fn which_finds_local_binaries() {
    let dispatcher = dispatcher();

    let path = dispatcher.which("sh", None).await.unwrap();
    assert!(path.starts_with('/'));
    assert!(path.ends_with("/sh"));

    let err = dispatcher
        .which("definitely-not-installed-xyz", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
