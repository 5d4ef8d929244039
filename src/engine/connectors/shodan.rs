// Paw Agent Engine — Shodan connector
// Internet intelligence search. API key travels as the `key` query param.

use super::{path, query, BodyMode, ServiceApi, ToolRoute, Verb};
use crate::atoms::types::ParamType;
use crate::engine::auth::AuthPlacement;
use serde_json::{json, Value};

pub struct Shodan;

impl ServiceApi for Shodan {
    fn service(&self) -> &'static str {
        "shodan"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.shodan.io"
    }

    fn auth_placement(&self) -> AuthPlacement {
        AuthPlacement::Query("key")
    }

    fn routes(&self) -> &'static [ToolRoute] {
        ROUTES
    }
}

const SEARCH_QUERY: &str = "Shodan search query, e.g. 'apache country:DE port:443'";

const ROUTES: &[ToolRoute] = &[
    ToolRoute {
        name: "host_info",
        description: "All services found on a host IP, with banners and location.",
        verb: Verb::Get,
        path: "/shodan/host/{ip}",
        params: &[
            path("ip", "Host IPv4/IPv6 address"),
            query("history", ParamType::Boolean, false, "Include historical banners"),
            query("minify", ParamType::Boolean, false, "Only ports and general host information"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "host_search",
        description: "Search Shodan using the same query syntax as the website.",
        verb: Verb::Get,
        path: "/shodan/host/search",
        params: &[
            query("query", ParamType::String, true, SEARCH_QUERY),
            query("facets", ParamType::String, false, "Comma-separated facets, e.g. 'country,org'"),
            query("page", ParamType::Integer, false, "Result page (100 results per page)"),
            query("minify", ParamType::Boolean, false, "Truncate larger fields"),
        ],
        body: BodyMode::Params,
        shape: Some(summarize_search),
    },
    ToolRoute {
        name: "host_count",
        description: "Number of results for a search query, without consuming query credits.",
        verb: Verb::Get,
        path: "/shodan/host/count",
        params: &[
            query("query", ParamType::String, true, SEARCH_QUERY),
            query("facets", ParamType::String, false, "Comma-separated facets"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "search_facets",
        description: "List the facets available for search queries.",
        verb: Verb::Get,
        path: "/shodan/host/search/facets",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "search_filters",
        description: "List the filters available for search queries.",
        verb: Verb::Get,
        path: "/shodan/host/search/filters",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "dns_resolve",
        description: "Resolve hostnames to IP addresses.",
        verb: Verb::Get,
        path: "/dns/resolve",
        params: &[query("hostnames", ParamType::Any, true, "Hostname or list of hostnames")],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "dns_reverse",
        description: "Look up hostnames defined for IP addresses.",
        verb: Verb::Get,
        path: "/dns/reverse",
        params: &[query("ips", ParamType::Any, true, "IP address or list of IP addresses")],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "dns_domain",
        description: "Subdomains and DNS records for a domain.",
        verb: Verb::Get,
        path: "/dns/domain/{domain}",
        params: &[
            path("domain", "Domain name, e.g. example.com"),
            query("history", ParamType::Boolean, false, "Include historical records"),
            query("type", ParamType::String, false, "Record type filter: A, AAAA, CNAME, NS, SOA, MX, TXT"),
            query("page", ParamType::Integer, false, "Result page"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "tools_myip",
        description: "The public IP address the request came from.",
        verb: Verb::Get,
        path: "/tools/myip",
        params: &[],
        body: BodyMode::Params,
        shape: Some(wrap_ip),
    },
    ToolRoute {
        name: "tools_httpheaders",
        description: "The HTTP headers the client sends to web servers.",
        verb: Verb::Get,
        path: "/tools/httpheaders",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "api_info",
        description: "Plan, remaining query and scan credits for the API key.",
        verb: Verb::Get,
        path: "/api-info",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "ports",
        description: "Ports Shodan crawls on the Internet.",
        verb: Verb::Get,
        path: "/shodan/ports",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "protocols",
        description: "Protocols usable for on-demand scans.",
        verb: Verb::Get,
        path: "/shodan/protocols",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "account_profile",
        description: "Account information for the API key owner.",
        verb: Verb::Get,
        path: "/account/profile",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
];

/// `/tools/myip` answers with a bare JSON string.
fn wrap_ip(v: Value) -> Value {
    match v {
        Value::String(ip) => json!({ "ip": ip }),
        other => other,
    }
}

/// Keep search results readable: drop raw banner payloads.
fn summarize_search(mut v: Value) -> Value {
    if let Some(matches) = v.get_mut("matches").and_then(Value::as_array_mut) {
        for m in matches.iter_mut() {
            if let Some(obj) = m.as_object_mut() {
                obj.remove("data");
                obj.remove("html");
                obj.remove("_shodan");
            }
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::auth::AuthStrategy;
    use crate::engine::connectors::Connector;
    use crate::engine::test_support::MockHttp;

    #[test]
    fn test_tool_set() {
        let names: Vec<&str> = ROUTES.iter().map(|r| r.name).collect();
        assert_eq!(names.len(), 14);
        assert!(names.contains(&"tools_myip"));
        assert!(names.contains(&"host_info"));
    }

    #[test]
    fn test_shapes() {
        assert_eq!(wrap_ip(json!("1.2.3.4")), json!({"ip": "1.2.3.4"}));
        let out = summarize_search(json!({"total": 1, "matches": [{"ip_str": "1.1.1.1", "data": "x"}]}));
        assert_eq!(out["matches"][0], json!({"ip_str": "1.1.1.1"}));
    }

    #[tokio::test]
    async fn test_myip_round_trip() {
        let mock = MockHttp::start(vec![(200, "\"203.0.113.9\"".into())]).await;
        let c = Connector::new(Box::new(Shodan), AuthStrategy::api_key("K1"))
            .unwrap()
            .with_base_url(&mock.base_url);
        let out = c.call_tool("tools_myip", &json!({})).await.unwrap();
        assert_eq!(out, json!({"ip": "203.0.113.9"}));
        assert_eq!(mock.requests()[0].path, "/tools/myip?key=K1");
    }

    #[tokio::test]
    async fn test_dns_resolve_joins_hostnames() {
        let mock = MockHttp::start(vec![(200, r#"{"a.com":"1.1.1.1"}"#.into())]).await;
        let c = Connector::new(Box::new(Shodan), AuthStrategy::api_key("K1"))
            .unwrap()
            .with_base_url(&mock.base_url);
        c.call_tool("dns_resolve", &json!({"hostnames": ["a.com", "b.com"]}))
            .await
            .unwrap();
        assert_eq!(mock.requests()[0].path, "/dns/resolve?hostnames=a.com%2Cb.com&key=K1");
    }
}
