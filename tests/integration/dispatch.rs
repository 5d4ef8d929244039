// End-to-end dispatch through ToolRuntime: local scripts, natives and
// connector tools behind one contract.

use super::support::Upstream;
use paw_tool_runtime::{ErrorKind, RuntimeConfig, ToolCallRequest, ToolOrigin, ToolRuntime};
use serde_json::json;
use std::time::{Duration, Instant as StdInstant};
use tokio::time::Instant;

const SLOW_SCRIPT: &str = r#"
/**
 * @callable
 * @description Busy-loops forever.
 * @timeout 250
 */
function forever() { while (true) {} }

/**
 * @callable
 * @param {string} who - Name to greet
 */
function greet(who) {
  console.log("greeting", who);
  return { success: true, message: "hello " + who };
}

/**
 * @callable
 */
function explode() { throw new Error("kaboom"); }
"#;

async fn runtime_with_github(base_url: &str) -> ToolRuntime {
    let toml = format!("[connectors.github]\ntoken = \"ghp_test\"\nbase_url = \"{}\"\n", base_url);
    let rt = ToolRuntime::new(RuntimeConfig::from_toml_str(&toml).unwrap()).unwrap();
    assert!(rt.connect_configured().await.is_empty());
    rt.load_script(SLOW_SCRIPT, "user:slow.js").unwrap();
    rt
}

#[tokio::test]
async fn test_local_and_remote_share_one_envelope() {
    let upstream = Upstream::start(vec![(200, r#"{"full_name":"paw/runtime","stargazers_count":7}"#)]).await;
    let rt = runtime_with_github(&upstream.base_url).await;

    let local = rt.dispatch("greet", &json!({"who": "paw"}), None).await;
    assert!(local.success);
    assert_eq!(local.origin, Some(ToolOrigin::Local));
    assert_eq!(local.value.unwrap()["message"], "hello paw");

    let remote = rt
        .dispatch("github_get_repo", &json!({"owner": "paw", "repo": "runtime"}), None)
        .await;
    assert!(remote.success, "{:?}", remote.message);
    assert_eq!(remote.origin, Some(ToolOrigin::Remote("github".into())));
    assert_eq!(remote.value.unwrap()["full_name"], "paw/runtime");
    assert_eq!(upstream.paths(), vec!["/repos/paw/runtime"]);
}

#[tokio::test]
async fn test_remote_validation_happens_before_any_request() {
    let upstream = Upstream::start(vec![(200, "{}")]).await;
    let rt = runtime_with_github(&upstream.base_url).await;

    let r = rt.dispatch("github_get_repo", &json!({"owner": "paw"}), None).await;
    assert_eq!(r.error_kind, Some(ErrorKind::ValidationError));
    assert!(r.message.unwrap().contains("repo"));
    assert!(upstream.paths().is_empty());
}

#[tokio::test]
async fn test_upstream_rejection_kind_survives_the_wire() {
    let upstream = Upstream::start(vec![(401, r#"{"message":"Bad credentials"}"#)]).await;
    let rt = runtime_with_github(&upstream.base_url).await;

    let r = rt.dispatch("github_get_authenticated_user", &json!({}), None).await;
    assert!(!r.success);
    assert_eq!(r.error_kind, Some(ErrorKind::AuthenticationFailed));
    assert!(!r.message.unwrap().contains("ghp_test"));
}

#[tokio::test]
async fn test_script_failures_are_typed() {
    let rt = runtime_with_github("http://127.0.0.1:9").await;

    let r = rt.dispatch("explode", &json!({}), None).await;
    assert_eq!(r.error_kind, Some(ErrorKind::ExecutionError));
    assert!(r.message.unwrap().contains("kaboom"));

    let started = StdInstant::now();
    let r = rt.dispatch("forever", &json!({}), None).await;
    assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(3));

    // The runaway call left nothing behind.
    let r = rt.dispatch("greet", &json!({"who": "again"}), None).await;
    assert!(r.success);
}

#[tokio::test]
async fn test_batch_mixes_origins_in_request_order() {
    let upstream = Upstream::start(vec![(200, r#"{"login":"octocat"}"#)]).await;
    let rt = runtime_with_github(&upstream.base_url).await;

    let calls = vec![
        ToolCallRequest { call_id: "a".into(), name: "forever".into(), arguments: json!({}) },
        ToolCallRequest { call_id: "b".into(), name: "github_get_authenticated_user".into(), arguments: json!({}) },
        ToolCallRequest { call_id: "c".into(), name: "factorial".into(), arguments: json!({"n": 4}) },
        ToolCallRequest { call_id: "d".into(), name: "nope".into(), arguments: json!({}) },
    ];
    let out = rt
        .dispatch_batch(calls, Some(Instant::now() + Duration::from_secs(5)))
        .await;

    let ids: Vec<&str> = out.iter().map(|o| o.call_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert_eq!(out[0].result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(out[1].result.value.as_ref().unwrap()["login"], "octocat");
    assert_eq!(out[2].result.value, Some(json!(24)));
    assert_eq!(out[3].result.error_kind, Some(ErrorKind::UnknownTool));
    assert_eq!(out[3].result.origin, None);
}

#[tokio::test]
async fn test_expired_caller_deadline() {
    let rt = runtime_with_github("http://127.0.0.1:9").await;
    let r = rt
        .dispatch("greet", &json!({"who": "late"}), Some(Instant::now()))
        .await;
    assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
}
