use serde_json::json;
use std::time::{Duration, Instant};
use testrig_common::Error;
use testrig_daemon::process::{ProcessManager, ServerConfig, ServerEvent, SERVER_ID_ENV};

/// A JSON-lines server written in sh: chatter first, then one response per request
const ECHO_SERVER: &str = r#"
echo "server booting"
echo "READY"
while read line; do
  echo "handling request"
  case "$line" in
    *fail*) echo '{"error":{"message":"tool exploded"}}' ;;
    *slow*) sleep 5 ;;
    *) echo "{\"result\":{\"server\":\"$TESTRIG_SERVER_ID\"}}" ;;
  esac
done
"#;

fn echo_server(name: &str) -> ServerConfig {
    ServerConfig::new(name, "sh")
        .args(["-c", ECHO_SERVER])
        .ready_line("READY")
}

/// Responses are matched past non-JSON chatter, and an `error` field
/// surfaces as `Err` from `execute_command`.
#[tokio::test]
async fn execute_command_decodes_results_and_errors() {
    let manager = ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
    let id = manager.start_server(echo_server("echo")).await.unwrap();

    let value = manager
        .execute_command(&id, "ping", json!({}))
        .await
        .unwrap();
    assert_eq!(value["server"], json!(id));

    let err = manager
        .execute_command(&id, "fail", json!({}))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Remote(msg) if msg.contains("tool exploded")),
        "unexpected error: {:?}",
        err
    );

    // The server is still usable after a remote error
    assert!(manager.execute_command(&id, "ping", json!({})).await.is_ok());

    // Starting the same name again reuses the live process
    assert_eq!(manager.start_server(echo_server("echo")).await.unwrap(), id);

    manager.stop_all_servers().await;
    assert!(!manager.is_server_running("echo"));
}

/// A call that never gets an answer fails with `ProcessCallTimeout`.
#[tokio::test]
async fn execute_command_times_out() {
    let manager =
        ProcessManager::with_timeouts(Duration::from_millis(200), Duration::from_secs(1));
    let id = manager.start_server(echo_server("slow")).await.unwrap();

    let started = Instant::now();
    let err = manager
        .execute_command(&id, "slow", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProcessCallTimeout { millis: 200, .. }));
    assert!(started.elapsed() < Duration::from_secs(2));

    manager.stop_all_servers().await;
}

/// Missing the ready marker within the startup timeout is a start failure.
#[tokio::test]
async fn missing_ready_marker_fails_start() {
    let manager = ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
    let mut config = ServerConfig::new("mute", "sh")
        .args(["-c", "sleep 10"])
        .ready_line("READY");
    config.startup_timeout = Duration::from_millis(200);

    let err = manager.start_server(config).await.unwrap_err();
    assert!(matches!(err, Error::ProcessStart { .. }));
    assert!(!manager.is_server_running("mute"));
}

/// With `max_restarts = 2`, the third crash exhausts the budget: the manager
/// reports it and stops tracking the server.
#[tokio::test]
async fn restart_budget_is_enforced() {
    let manager = ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
    let mut events = manager.subscribe();

    let config = ServerConfig::new("crashy", "sh")
        .args(["-c", "sleep 0.2; exit 1"])
        .max_restarts(2);
    manager.start_server(config).await.unwrap();

    let mut restarts = Vec::new();
    let exhausted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Restarting { attempt, .. }) => restarts.push(attempt),
                Ok(ServerEvent::RestartBudgetExhausted { restarts: count, .. }) => return count,
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("budget was never exhausted");

    assert_eq!(restarts, vec![1, 2]);
    assert_eq!(exhausted, 2);
    assert!(!manager.is_server_running("crashy"));
    assert_eq!(manager.resource_usage().total, 0);
}

/// Stopping a server that ignores SIGTERM falls back to SIGKILL.
#[tokio::test]
async fn stop_escalates_to_sigkill() {
    let manager =
        ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_millis(200));
    let id = manager
        .start_server(
            ServerConfig::new("stubborn", "sh")
                .args(["-c", "trap '' TERM; echo READY; while true; do sleep 1; done"])
                .ready_line("READY"),
        )
        .await
        .unwrap();

    let started = Instant::now();
    assert!(manager.stop_server(&id).await);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(manager.get_server_status(&id).is_none());
}

/// The ready marker may share its line with other output; the exported
/// server id is what the child sees.
#[tokio::test]
async fn ready_marker_and_exported_id() {
    let manager = ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
    let script = format!(
        "echo \"boot ${env} READY\"; read line; echo \"{{\\\"result\\\":\\\"${env}\\\"}}\"",
        env = SERVER_ID_ENV
    );
    let id = manager
        .start_server(
            ServerConfig::new("env", "sh")
                .args(["-c", script.as_str()])
                .ready_line("READY"),
        )
        .await
        .unwrap();

    let status = manager.get_server_status(&id).unwrap();
    assert_eq!(status.name, "env");
    assert!(status.running);
    assert_eq!(status.restart_count, 0);

    let value = manager.execute_command(&id, "whoami", json!({})).await.unwrap();
    assert_eq!(value, json!(id));

    manager.stop_all_servers().await;
}

/// A server that stays quiet past the inactivity threshold is flagged
/// unhealthy and then restarted.
#[tokio::test]
async fn silent_server_is_restarted() {
    let manager =
        ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_millis(200));
    let mut events = manager.subscribe();

    let mut config = ServerConfig::new("quiet", "sh")
        .args(["-c", "echo READY; while true; do sleep 1; done"])
        .ready_line("READY")
        .max_restarts(1);
    config.health_check_interval = Duration::from_millis(100);
    config.inactivity_threshold = Some(Duration::from_millis(300));
    let first = manager.start_server(config).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event @ ServerEvent::Unhealthy { .. }) => seen.push(event),
                Ok(event @ ServerEvent::Restarting { .. }) => {
                    seen.push(event);
                    return seen;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("server was never restarted");

    match seen.as_slice() {
        [ServerEvent::Unhealthy { id, reason, .. }, ServerEvent::Restarting { attempt: 1, .. }] => {
            assert_eq!(id, &first);
            assert!(reason.contains("no output"), "{}", reason);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert!(manager.get_server_status(&first).is_none());

    manager.stop_all_servers().await;
}
