//! End-to-end runs against real child processes. Unix only: the suite
//! drives everything through `sh`.
#![cfg(unix)]

use anyhow::Result;
use corral_runner::{
    logctx, run_agent, run_command, ChannelConfig, ChannelEndpoint, Error, LogContext, MemorySink,
    ResultSchema, RunRequest, RunnerConfig, RunnerRegistry, TermSignal,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sh(script: impl Into<String>) -> RunRequest {
    RunRequest::new("sh").arg("-c").arg(script)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn test_callback_result_resolves_run() -> Result<()> {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let (url_tx, url_rx) = tokio::sync::oneshot::channel::<String>();

    tokio::spawn(async move {
        let url = match url_rx.await {
            Ok(url) => url,
            Err(_) => return,
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = reqwest::Client::new()
            .post(&url)
            .json(&json!({"status": "ok", "answer": 42}))
            .send()
            .await;
    });

    let started = Instant::now();
    let run = run_agent(
        &registry,
        "coder",
        ChannelConfig::Callback { schema: None },
        move |endpoint| {
            if let ChannelEndpoint::Callback { url } = endpoint {
                let _ = url_tx.send(url.clone());
            }
            sh("echo working; sleep 5").with_grace_period(Duration::from_millis(100))
        },
    )
    .await?;

    assert_eq!(run.result.result["status"], json!("ok"));
    assert_eq!(run.result.result["answer"], json!(42));
    assert!(run.output.contains("working"));
    // The run resolved on delivery, not on the 5s sleep.
    assert!(started.elapsed() < Duration::from_secs(4));
    // The leftover process was torn down before the call returned.
    assert!(run.exit_code.is_some());
    Ok(())
}

#[tokio::test]
async fn test_result_posted_just_before_exit_wins() -> Result<()> {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());

    // The process submits its result and exits immediately, so the exit
    // future can settle before the delivery is observed. The delivered
    // result must still win over a premature-exit verdict.
    let run = run_agent(
        &registry,
        "coder",
        ChannelConfig::Callback { schema: None },
        |endpoint| {
            let ChannelEndpoint::Callback { url } = endpoint else {
                unreachable!("callback channel hands out a url");
            };
            sh(format!(
                "curl -s -X POST -H 'content-type: application/json' \
                 -d '{{\"status\": \"ok\"}}' '{url}'; exit 0"
            ))
        },
    )
    .await?;

    assert_eq!(run.result.result["status"], json!("ok"));
    assert_eq!(run.exit_code, Some(0));
    Ok(())
}

#[tokio::test]
async fn test_exit_without_result_is_premature() {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let err = run_agent(
        &registry,
        "coder",
        ChannelConfig::Callback { schema: None },
        |_endpoint| sh("exit 3"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::PrematureExit { code: 3 }));
}

#[tokio::test]
async fn test_silent_run_hits_watchdog() {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let started = Instant::now();
    let err = run_agent(
        &registry,
        "coder",
        ChannelConfig::Callback { schema: None },
        |_endpoint| sh("sleep 5").with_inactivity_timeout(Duration::from_millis(300)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::InactivityTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));

    // Expiry skips the grace wait: a SIGTERM plan was issued immediately.
    let plans = registry.planner().recorded_plans();
    assert!(!plans.is_empty());
    assert_eq!(plans[0].signal, TermSignal::Term);
}

#[tokio::test]
async fn test_file_channel_resolves_run() -> Result<()> {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("agent-result-1.json");

    let run = run_agent(
        &registry,
        "coder",
        ChannelConfig::File {
            path: path.clone(),
            schema: None,
        },
        |endpoint| {
            let ChannelEndpoint::File { path } = endpoint else {
                unreachable!("file channel hands out a path");
            };
            sh(format!(
                "printf '%s' '{{\"status\": \"done\"}}' > '{}'",
                path.display()
            ))
        },
    )
    .await?;

    assert_eq!(run.result.result["status"], json!("done"));
    assert_eq!(run.exit_code, Some(0));
    // Consumed on delivery.
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn test_schema_rejection_in_file_mode_is_terminal() {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent-result-2.json");

    let schema: Arc<dyn ResultSchema> =
        Arc::new(|value: &Value| -> std::result::Result<(), String> {
            if value.get("status").and_then(Value::as_str) == Some("ok") {
                Ok(())
            } else {
                Err("status must be \"ok\"".to_string())
            }
        });

    let err = run_agent(
        &registry,
        "coder",
        ChannelConfig::File {
            path,
            schema: Some(schema),
        },
        |endpoint| {
            let ChannelEndpoint::File { path } = endpoint else {
                unreachable!("file channel hands out a path");
            };
            sh(format!(
                "printf '%s' '{{\"status\": \"wip\"}}' > '{}'",
                path.display()
            ))
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidResultPayload(_)));
}

#[tokio::test]
async fn test_tool_pool_serializes_runs() -> Result<()> {
    init_tracing();
    let config = RunnerConfig::default().with_tool_concurrency("coder", 1);
    let registry = Arc::new(RunnerRegistry::new(config));
    let dir = tempfile::tempdir()?;

    let started = Instant::now();
    let mut handles = Vec::new();
    for run_no in 0..2 {
        let registry = Arc::clone(&registry);
        let path = dir.path().join(format!("agent-result-{run_no}.json"));
        handles.push(tokio::spawn(async move {
            run_agent(
                &registry,
                "coder",
                ChannelConfig::File { path, schema: None },
                |endpoint| {
                    let ChannelEndpoint::File { path } = endpoint else {
                        unreachable!("file channel hands out a path");
                    };
                    sh(format!(
                        "sleep 0.5; printf '%s' '{{\"status\": \"ok\"}}' > '{}'",
                        path.display()
                    ))
                },
            )
            .await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    // Two 500ms runs through a pool of one cannot overlap.
    assert!(started.elapsed() >= Duration::from_millis(900));
    Ok(())
}

#[tokio::test]
async fn test_aux_pool_serializes_commands() -> Result<()> {
    init_tracing();
    let mut config = RunnerConfig::default();
    config.aux_concurrency = 1;
    let registry = Arc::new(RunnerRegistry::new(config));

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            run_command(&registry, sh("sleep 0.5")).await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    assert!(started.elapsed() >= Duration::from_millis(900));
    Ok(())
}

#[tokio::test]
async fn test_command_output_carries_run_prefix() -> Result<()> {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let sink = MemorySink::new();
    let scope = LogContext::new().with_sink_override(sink.clone());

    let outcome = logctx::with_context(scope, run_command(&registry, sh("echo hi"))).await?;

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.output.contains("hi"));
    let expected = format!("[{}] hi", outcome.run_id);
    assert!(
        sink.lines().iter().any(|line| line == &expected),
        "missing {expected:?} in {:?}",
        sink.lines()
    );
    // Exited on its own; no termination plan was needed.
    assert!(registry.planner().recorded_plans().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failing_command_reports_exit_code() -> Result<()> {
    init_tracing();
    let registry = RunnerRegistry::new(RunnerConfig::default());
    let outcome = run_command(&registry, sh("echo oops >&2; exit 7")).await?;
    assert_eq!(outcome.exit_code, 7);
    assert!(outcome.output.contains("oops"));
    Ok(())
}
