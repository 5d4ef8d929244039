// Paw Agent Engine — Gmail connector
// Gmail API v1 for the authenticated user (`users/me`), OAuth bearer.
// Outgoing mail is built as RFC 2822 text and sent base64url-encoded.

use super::{body, path, query, BodyMode, ServiceApi, ToolRoute, Verb};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ParamType;
use crate::engine::auth::AuthPlacement;
use base64::Engine as _;
use serde_json::{json, Map, Value};

pub struct Gmail;

impl ServiceApi for Gmail {
    fn service(&self) -> &'static str {
        "gmail"
    }

    fn default_base_url(&self) -> &'static str {
        "https://gmail.googleapis.com/gmail/v1/users/me"
    }

    fn auth_placement(&self) -> AuthPlacement {
        AuthPlacement::Bearer
    }

    fn routes(&self) -> &'static [ToolRoute] {
        ROUTES
    }
}

const MESSAGE_ID: super::RouteParam = path("id", "Message id");
const SEARCH: super::RouteParam = query("q", ParamType::String, false, "Gmail search query, e.g. 'from:alice is:unread'");
const MAX_RESULTS: super::RouteParam = query("maxResults", ParamType::Integer, false, "Maximum results (default 100)");
const PAGE_TOKEN: super::RouteParam = query("pageToken", ParamType::String, false, "Token from a previous page");

const COMPOSE: &[super::RouteParam] = &[
    body("to", ParamType::String, true, "Recipient address(es), comma-separated"),
    body("subject", ParamType::String, true, "Subject line"),
    body("body", ParamType::String, true, "Plain-text body"),
    body("cc", ParamType::String, false, "Cc address(es)"),
    body("bcc", ParamType::String, false, "Bcc address(es)"),
];

const ROUTES: &[ToolRoute] = &[
    ToolRoute {
        name: "get_profile",
        description: "Email address and mailbox counters of the account.",
        verb: Verb::Get,
        path: "/profile",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "list_messages",
        description: "Message ids matching a search query.",
        verb: Verb::Get,
        path: "/messages",
        params: &[
            SEARCH,
            MAX_RESULTS,
            PAGE_TOKEN,
            query("labelIds", ParamType::String, false, "Only messages with this label id"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "get_message",
        description: "One message with headers and snippet.",
        verb: Verb::Get,
        path: "/messages/{id}",
        params: &[
            MESSAGE_ID,
            query("format", ParamType::String, false, "full, metadata, minimal or raw"),
        ],
        body: BodyMode::Params,
        shape: Some(summarize_message),
    },
    ToolRoute {
        name: "send_message",
        description: "Send a plain-text email.",
        verb: Verb::Post,
        path: "/messages/send",
        params: COMPOSE,
        body: BodyMode::Custom(encode_message),
        shape: None,
    },
    ToolRoute {
        name: "create_draft",
        description: "Save a plain-text email as a draft.",
        verb: Verb::Post,
        path: "/drafts",
        params: COMPOSE,
        body: BodyMode::Custom(encode_draft),
        shape: None,
    },
    ToolRoute {
        name: "list_labels",
        description: "All labels of the mailbox.",
        verb: Verb::Get,
        path: "/labels",
        params: &[],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "modify_labels",
        description: "Add or remove labels on a message.",
        verb: Verb::Post,
        path: "/messages/{id}/modify",
        params: &[
            MESSAGE_ID,
            body("addLabelIds", ParamType::Array, false, "Label ids to add"),
            body("removeLabelIds", ParamType::Array, false, "Label ids to remove"),
        ],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "trash_message",
        description: "Move a message to the trash.",
        verb: Verb::Post,
        path: "/messages/{id}/trash",
        params: &[MESSAGE_ID],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "untrash_message",
        description: "Restore a message from the trash.",
        verb: Verb::Post,
        path: "/messages/{id}/untrash",
        params: &[MESSAGE_ID],
        body: BodyMode::Params,
        shape: None,
    },
    ToolRoute {
        name: "list_threads",
        description: "Thread ids matching a search query.",
        verb: Verb::Get,
        path: "/threads",
        params: &[SEARCH, MAX_RESULTS, PAGE_TOKEN],
        body: BodyMode::Params,
        shape: None,
    },
];

// ── Message encoding ───────────────────────────────────────────────────

fn encode_message(args: &Value) -> EngineResult<Value> {
    Ok(json!({ "raw": build_raw_message(args)? }))
}

fn encode_draft(args: &Value) -> EngineResult<Value> {
    Ok(json!({ "message": { "raw": build_raw_message(args)? } }))
}

fn header_value<'a>(args: &'a Value, field: &str) -> EngineResult<Option<&'a str>> {
    match args.get(field).and_then(Value::as_str) {
        Some(v) if v.contains('\r') || v.contains('\n') => Err(EngineError::validation(
            "gmail",
            format!("'{}' must not contain line breaks", field),
        )),
        Some(v) if !v.trim().is_empty() => Ok(Some(v.trim())),
        _ => Ok(None),
    }
}

/// RFC 2822 message, base64url without padding as the Gmail API expects.
fn build_raw_message(args: &Value) -> EngineResult<String> {
    let to = header_value(args, "to")?
        .ok_or_else(|| EngineError::validation("gmail", "'to' is required"))?;
    let subject = header_value(args, "subject")?.unwrap_or_default();
    let text = args["body"].as_str().unwrap_or_default();

    let mut mime = format!("To: {}\r\n", to);
    if let Some(cc) = header_value(args, "cc")? {
        mime.push_str(&format!("Cc: {}\r\n", cc));
    }
    if let Some(bcc) = header_value(args, "bcc")? {
        mime.push_str(&format!("Bcc: {}\r\n", bcc));
    }
    if subject.is_ascii() {
        mime.push_str(&format!("Subject: {}\r\n", subject));
    } else {
        let encoded = base64::engine::general_purpose::STANDARD.encode(subject);
        mime.push_str(&format!("Subject: =?UTF-8?B?{}?=\r\n", encoded));
    }
    mime.push_str("MIME-Version: 1.0\r\n");
    mime.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    mime.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    mime.push_str(&text.replace("\r\n", "\n").replace('\n', "\r\n"));

    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mime))
}

/// Lift the common headers out of `payload.headers` for readability.
fn summarize_message(mut v: Value) -> Value {
    let mut picked = Map::new();
    if let Some(headers) = v["payload"]["headers"].as_array() {
        for h in headers {
            let (Some(name), Some(value)) = (h["name"].as_str(), h["value"].as_str()) else {
                continue;
            };
            if matches!(name, "From" | "To" | "Cc" | "Subject" | "Date") {
                picked.insert(name.to_lowercase(), Value::String(value.to_string()));
            }
        }
    }
    if let Some(obj) = v.as_object_mut() {
        if !picked.is_empty() {
            obj.insert("headers".into(), Value::Object(picked));
        }
    }
    v
}
