// Building a runtime from a TOML document.

use super::support::Upstream;
use paw_tool_runtime::{ErrorKind, RuntimeConfig, ToolRuntime};
use serde_json::json;

#[tokio::test]
async fn test_startup_connects_what_is_enabled() {
    let upstream = Upstream::start(vec![(200, r#"{"query_credits": 100, "scan_credits": 5}"#)]).await;
    let toml = format!(
        r#"
[sandbox]
default_timeout_ms = 1500

[connectors.shodan]
api_key = "shodan-key"
base_url = "{base}"

[connectors.github]
enabled = false
token = "t"

[[mcp.servers]]
name = "broken"
command = "/nonexistent/mcp-server"

[[mcp.servers]]
name = "later"
transport = "http"
url = "http://127.0.0.1:9/mcp"
enabled = false
"#,
        base = upstream.base_url
    );
    let rt = ToolRuntime::new(RuntimeConfig::from_toml_str(&toml).unwrap()).unwrap();
    let failures = rt.connect_configured().await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");
    assert_eq!(rt.mcp().connected_names(), vec!["shodan"]);

    let names: Vec<String> = rt.list_tools().await.into_iter().map(|d| d.name).collect();
    assert!(names.iter().any(|n| n == "shodan_api_info"));
    assert!(!names.iter().any(|n| n.starts_with("github_")));
    // Local tools are listed before remote ones.
    let first_remote = names.iter().position(|n| n.starts_with("shodan_")).unwrap();
    assert!(names[..first_remote].iter().any(|n| n == "factorial"));
    assert!(names[first_remote..].iter().all(|n| n.starts_with("shodan_")));

    let r = rt.dispatch("shodan_api_info", &json!({}), None).await;
    assert!(r.success, "{:?}", r.message);
    assert_eq!(r.value.unwrap()["query_credits"], 100);
    // The key travels as a query parameter.
    assert!(upstream.paths()[0].contains("key=shodan-key"));

    // Local timeouts come from [sandbox].
    assert_eq!(rt.registry().get("factorial").unwrap().timeout_ms, 1500);
}

#[tokio::test]
async fn test_remote_name_clash_rolls_back_connection() {
    let toml = "[connectors.github]\ntoken = \"t\"\nbase_url = \"http://127.0.0.1:9\"\n";
    let rt = ToolRuntime::new(RuntimeConfig::from_toml_str(toml).unwrap()).unwrap();

    let clash = r#"
/**
 * @callable
 */
function github_get_repo() { return "local"; }
"#;
    rt.load_script(clash, "user:clash.js").unwrap();

    let err = rt.connect_connector("github").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert!(rt.mcp().get("github").is_none());

    let r = rt.dispatch("github_get_repo", &json!({}), None).await;
    assert_eq!(r.value, Some(json!("local")));
}

#[test]
fn test_invalid_document_is_rejected() {
    let err = RuntimeConfig::from_toml_str("[connectors.slack]\ntoken = \"x\"").unwrap_err();
    assert!(err.to_string().contains("unknown connector"));
}
