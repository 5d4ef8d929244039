// Paw Agent Engine — GitHub connector
// REST v3 with a personal access token (bearer).

use super::{body, path, path_num, query, BodyMode, ServiceApi, ToolRoute, Verb};
use crate::atoms::types::ParamType;
use crate::engine::auth::AuthPlacement;
use base64::Engine as _;
use serde_json::Value;

pub struct GitHub;

impl ServiceApi for GitHub {
    fn service(&self) -> &'static str {
        "github"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.github.com"
    }

    fn auth_placement(&self) -> AuthPlacement {
        AuthPlacement::Bearer
    }

    fn routes(&self) -> &'static [ToolRoute] {
        ROUTES
    }

    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }
}

const OWNER: super::RouteParam = path("owner", "Repository owner (user or org)");
const REPO: super::RouteParam = path("repo", "Repository name");
const PER_PAGE: super::RouteParam = query("per_page", ParamType::Integer, false, "Results per page (max 100)");
const PAGE: super::RouteParam = query("page", ParamType::Integer, false, "Page number");

const ROUTES: &[ToolRoute] = &[
    ToolRoute {
        name: "get_authenticated_user",
        description: "Profile of the user the token belongs to.",
        verb: Verb::Get,
        path: "/user",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "list_repos",
        description: "Repositories of the authenticated user.",
        verb: Verb::Get,
        path: "/user/repos",
        params: &[
            query("visibility", ParamType::String, false, "all, public or private"),
            query("sort", ParamType::String, false, "created, updated, pushed or full_name"),
            PER_PAGE,
            PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "get_repo",
        description: "Details of one repository.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}",
        params: &[OWNER, REPO],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "list_issues",
        description: "Issues of a repository (pull requests included by GitHub).",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/issues",
        params: &[
            OWNER,
            REPO,
            query("state", ParamType::String, false, "open, closed or all"),
            query("labels", ParamType::String, false, "Comma-separated label names"),
            PER_PAGE,
            PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "get_issue",
        description: "One issue by number.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/issues/{issue_number}",
        params: &[OWNER, REPO, path_num("issue_number", "Issue number")],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "create_issue",
        description: "Open a new issue.",
        verb: Verb::Post,
        path: "/repos/{owner}/{repo}/issues",
        params: &[
            OWNER,
            REPO,
            body("title", ParamType::String, true, "Issue title"),
            body("body", ParamType::String, false, "Issue body (Markdown)"),
            body("labels", ParamType::Array, false, "Label names"),
            body("assignees", ParamType::Array, false, "Logins to assign"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "comment_issue",
        description: "Comment on an issue or pull request.",
        verb: Verb::Post,
        path: "/repos/{owner}/{repo}/issues/{issue_number}/comments",
        params: &[
            OWNER,
            REPO,
            path_num("issue_number", "Issue or pull request number"),
            body("body", ParamType::String, true, "Comment text (Markdown)"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "list_pulls",
        description: "Pull requests of a repository.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/pulls",
        params: &[
            OWNER,
            REPO,
            query("state", ParamType::String, false, "open, closed or all"),
            PER_PAGE,
            PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "get_pull",
        description: "One pull request by number.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/pulls/{pull_number}",
        params: &[OWNER, REPO, path_num("pull_number", "Pull request number")],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "get_file_contents",
        description: "Contents of a file (decoded) or a directory listing.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/contents/{path}",
        params: &[
            OWNER,
            REPO,
            path("path", "File or directory path inside the repository"),
            query("ref", ParamType::String, false, "Branch, tag or commit SHA"),
        ],
        body: BodyMode::Params,
        shape: Some(decode_contents),
    },
    ToolRoute {
        name: "list_commits",
        description: "Commits of a repository, newest first.",
        verb: Verb::Get,
        path: "/repos/{owner}/{repo}/commits",
        params: &[
            OWNER,
            REPO,
            query("sha", ParamType::String, false, "Branch or SHA to start from"),
            query("path", ParamType::String, false, "Only commits touching this path"),
            PER_PAGE,
            PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "search_repositories",
        description: "Search repositories with GitHub search syntax.",
        verb: Verb::Get,
        path: "/search/repositories",
        params: &[
            query("q", ParamType::String, true, "Search query, e.g. 'tokio language:rust'"),
            query("sort", ParamType::String, false, "stars, forks or updated"),
            query("order", ParamType::String, false, "asc or desc"),
            PER_PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "search_code",
        description: "Search code across repositories.",
        verb: Verb::Get,
        path: "/search/code",
        params: &[
            query("q", ParamType::String, true, "Search query, e.g. 'JsRuntime repo:denoland/deno'"),
            PER_PAGE,
        ],
        body: BodyMode::Params,
        shape: None,
    },
];

/// Add a `decoded` field to base64 file payloads.
fn decode_contents(mut v: Value) -> Value {
    let is_base64 = v["encoding"].as_str() == Some("base64");
    let decoded = v["content"].as_str().filter(|_| is_base64).and_then(|content| {
        let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    });
    if let (Some(text), Some(obj)) = (decoded, v.as_object_mut()) {
        obj.remove("content");
        obj.insert("decoded".into(), Value::String(text));
    }
    v
}
