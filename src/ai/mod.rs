//! Retrieval-augmented chat pipeline.
//!
//! `/ai/ask` runs the two-hop orchestration (vector search, then chat
//! completion) and `/ai/optimize-and-add` turns a Q&A pair into a curated
//! knowledge entry. Upstream failures on the ask path degrade to an empty
//! context or a fallback answer; a chat request never 500s because a
//! collaborator is down.

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::kb;
use crate::llm::ChatMessage;
use crate::shared::error::ApiError;
use crate::shared::models::{NewChatLog, NewKnowledgeEntry};
use crate::shared::state::AppState;
use crate::vector::SearchHit;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Literal answer used whenever the LLM yields nothing.
pub const FALLBACK_ANSWER: &str = "无法生成回答";

const SEARCH_TOP_K: usize = 5;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ai/ask", post(ask))
        .route("/ai/optimize-and-add", post(optimize_and_add))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AskOutcome {
    pub question: String,
    pub answer: String,
    pub context_used: Vec<SearchHit>,
}

async fn ask(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(request): Json<AskRequest>,
) -> Json<AskOutcome> {
    let user_id = request
        .user_id
        .or(user.map(|u| u.user.id))
        .unwrap_or(0);
    let outcome = answer_question(&state, &request.question, user_id, false).await;
    Json(outcome)
}

/// The ask pipeline. `via_wechat` callers get a sanitized answer and the
/// chat log row flagged accordingly.
pub async fn answer_question(
    state: &Arc<AppState>,
    question: &str,
    user_id: i64,
    via_wechat: bool,
) -> AskOutcome {
    let context_used = match state.vector.search(question, SEARCH_TOP_K).await {
        Ok(hits) => hits,
        Err(e) => {
            warn!("vector search unavailable, answering without context: {}", e);
            Vec::new()
        }
    };

    let context = context_used
        .iter()
        .map(|hit| hit.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let messages = [
        ChatMessage::system(format!(
            "{}根据提供的知识库回答用户问题。",
            state.config.ai.system_prompt
        )),
        ChatMessage::user(format!("已知资料:\n{}\n\n问题:{}", context, question)),
    ];

    let mut answer = match state.llm.chat(&messages).await {
        Ok(Some(content)) if !content.is_empty() => content,
        Ok(_) => FALLBACK_ANSWER.to_string(),
        Err(e) => {
            warn!("chat completion failed, returning fallback answer: {}", e);
            FALLBACK_ANSWER.to_string()
        }
    };

    if via_wechat {
        answer = sanitize_answer(&answer);
        if answer.is_empty() {
            answer = FALLBACK_ANSWER.to_string();
        }
    }

    log_exchange(
        state,
        NewChatLog {
            user_id,
            question: question.to_string(),
            answer: answer.clone(),
            is_wechat: via_wechat,
        },
    )
    .await;

    AskOutcome {
        question: question.to_string(),
        answer,
        context_used,
    }
}

/// Persist one ChatExchange row; a storage failure is logged, never surfaced
/// to the person chatting.
async fn log_exchange(state: &Arc<AppState>, row: NewChatLog) {
    use crate::shared::models::schema::ai_chat_logs;
    use diesel::prelude::*;

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| e.to_string())?;
        diesel::insert_into(ai_chat_logs::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| e.to_string())
    })
    .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("failed to store chat log: {}", e),
        Err(e) => error!("chat log task panicked: {}", e),
    }
}

// ---------------------------------------------------------------------------
// Answer sanitizer
// ---------------------------------------------------------------------------

/// Prepare an answer for a plain-text messaging channel: normalize CR/CRLF
/// to LF, drop every `#`, `*` and backtick, collapse 3+ newlines to exactly
/// two, trim. Character-level stripping, not markdown-aware, so unrelated
/// text containing those characters is mangled too. Idempotent.
pub fn sanitize_answer(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    let mut newline_run = 0usize;
    for ch in normalized.chars() {
        match ch {
            '#' | '*' | '`' => {}
            '\n' => {
                newline_run += 1;
                if newline_run <= 2 {
                    out.push('\n');
                }
            }
            _ => {
                newline_run = 0;
                out.push(ch);
            }
        }
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Knowledge curation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CuratedKnowledge {
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawCuratedEntry {
    title: Option<String>,
    content: Option<String>,
    category: Option<String>,
    tags: Option<Vec<String>>,
}

/// Strip an optional ```json fence so a wrapped response parses exactly like
/// a bare one.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim()
}

/// Decode the LLM's restructured entry. Missing title or content is a
/// `MalformedLlmOutput` carrying the untouched raw text for diagnosis.
pub fn parse_curated(raw: &str) -> Result<CuratedKnowledge, ApiError> {
    let decoded: RawCuratedEntry =
        serde_json::from_str(strip_code_fence(raw)).map_err(|e| ApiError::MalformedLlmOutput {
            message: format!("解析优化内容失败: {}", e),
            raw_content: raw.to_string(),
        })?;
    match (decoded.title, decoded.content) {
        (Some(title), Some(content)) if !title.is_empty() && !content.is_empty() => {
            Ok(CuratedKnowledge {
                title,
                content,
                category: decoded.category,
                tags: decoded.tags.unwrap_or_default(),
            })
        }
        _ => Err(ApiError::MalformedLlmOutput {
            message: "无法解析优化后的内容：缺少必要字段".to_string(),
            raw_content: raw.to_string(),
        }),
    }
}

async fn optimize_and_add(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Json(request): Json<OptimizeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = [
        ChatMessage::system(
            "你是一个知识整理专家，需要将用户的问题和AI的回答整理成适合知识库的条目。\
             保留核心信息，使其结构化、易于理解，并添加适当的分类和标签。",
        ),
        ChatMessage::user(format!(
            "用户问题: {}\n\nAI回答: {}\n\n请将上述内容整理成适合知识库的条目，\
             返回格式为JSON，包含title(标题)、content(内容)、category(分类)和tags(标签数组)字段。\
             不要添加任何额外的解释文字。",
            request.question, request.answer
        )),
    ];

    let raw = match state.llm.chat(&messages).await {
        Ok(content) => content.unwrap_or_default(),
        Err(e) => {
            warn!("curation completion failed: {}", e);
            String::new()
        }
    };

    let curated = parse_curated(&raw)?;

    let row = NewKnowledgeEntry {
        title: curated.title.clone(),
        content: curated.content.clone(),
        category: kb::category_or_default(curated.category.clone(), &state.config.system_mode),
        tags: serde_json::to_value(&curated.tags).unwrap_or_else(|_| json!([])),
    };
    let entry = kb::insert_entry(&state.conn, row).await?;

    // Dual write: the entry stays created even when indexing fails; the
    // divergence is the operator's to reconcile from this log line.
    if let Err(e) = state
        .vector
        .add_doc_with_fallback(entry.id, &entry.content)
        .await
    {
        error!(
            "knowledge entry {} created but vector indexing failed: {}",
            entry.id, e
        );
    }

    Ok(Json(json!({
        "status": "ok",
        "id": entry.id,
        "optimized": curated,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_markdown_characters() {
        let out = sanitize_answer("# Title\n**bold** and `code`");
        assert!(!out.contains('#'));
        assert!(!out.contains('*'));
        assert!(!out.contains('`'));
        assert_eq!(out, "Title\nbold and code");
    }

    #[test]
    fn sanitize_collapses_newline_runs() {
        let out = sanitize_answer("a\n\n\n\n\nb");
        assert_eq!(out, "a\n\nb");
        assert!(!sanitize_answer("x\n\n\ny").contains("\n\n\n"));
    }

    #[test]
    fn sanitize_normalizes_carriage_returns() {
        assert_eq!(sanitize_answer("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "# One\r\n\r\n\r\n*two* `three`",
            "   plain text   ",
            "\n\n\n\n",
            "中文**回答**\r\r测试",
        ];
        for input in inputs {
            let once = sanitize_answer(input);
            assert_eq!(sanitize_answer(&once), once, "input: {:?}", input);
        }
    }

    #[test]
    fn fenced_json_parses_like_bare_json() {
        let bare = r#"{"title":"T","content":"C","category":"cat","tags":["a","b"]}"#;
        let fenced = format!("```json\n{}\n```", bare);
        let a = parse_curated(bare).unwrap();
        let b = parse_curated(&fenced).unwrap();
        assert_eq!(a.title, b.title);
        assert_eq!(a.content, b.content);
        assert_eq!(a.category, b.category);
        assert_eq!(a.tags, b.tags);
    }

    #[test]
    fn curated_defaults_for_optional_fields() {
        let parsed = parse_curated(r#"{"title":"T","content":"C"}"#).unwrap();
        assert_eq!(parsed.category, None);
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn missing_required_fields_keeps_raw_content() {
        let raw = "```json\n{\"title\":\"only\"}\n```";
        match parse_curated(raw) {
            Err(ApiError::MalformedLlmOutput { raw_content, .. }) => {
                assert_eq!(raw_content, raw);
            }
            other => panic!("expected MalformedLlmOutput, got {:?}", other.map(|c| c.title)),
        }
    }

    #[test]
    fn unparseable_output_is_rejected() {
        assert!(parse_curated("").is_err());
        assert!(parse_curated("not json at all").is_err());
    }
}
