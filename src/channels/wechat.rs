//! WeChat Official Account gateway.
//!
//! Plaintext-mode webhook only: inbound requests are integrity-checked with
//! the SHA-1 signature scheme and bodies arrive as unencrypted XML. The
//! encrypted message mode is a deliberate non-feature. Text messages are
//! routed through the ask pipeline; subscribe/unsubscribe events maintain
//! the wechat_users table.

use crate::ai;
use crate::shared::models::{
    schema::wechat_users, NewWeChatUser, WeChatUser, WECHAT_STATUS_FOLLOWED,
    WECHAT_STATUS_UNFOLLOWED,
};
use crate::shared::state::AppState;
use crate::shared::utils::random_token;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// WeChat rejects replies beyond its size ceiling; the ceiling is bytes but
/// the cut is applied on characters, a known approximation.
const REPLY_CHAR_LIMIT: usize = 500;

const SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const SESSION_ID_LENGTH: usize = 32;

/// Safety margin subtracted from the provider-declared token expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 600;
const ACCESS_TOKEN_CACHE_KEY: &str = "wechat_access_token";

pub fn configure() -> Router<Arc<AppState>> {
    Router::new().route("/wechat", get(validate_server).post(handle_message))
}

// ---------------------------------------------------------------------------
// Signature validation
// ---------------------------------------------------------------------------

/// Plaintext-mode check: sha1 over the lexicographically sorted
/// concatenation of token, timestamp and nonce must equal the signature.
pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    let mut params = [token, timestamp, nonce];
    params.sort_unstable();
    let joined = params.concat();
    hex::encode(Sha1::digest(joined.as_bytes())) == signature
}

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: String,
}

async fn validate_server(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Response {
    let matched = verify_signature(
        &state.config.wechat.token,
        &params.timestamp,
        &params.nonce,
        &params.signature,
    );
    info!("wechat server validation, signature_match={}", matched);
    if matched {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            params.echostr,
        )
            .into_response()
    } else {
        error!("wechat server validation failed: invalid signature");
        (StatusCode::FORBIDDEN, "Invalid signature").into_response()
    }
}

// ---------------------------------------------------------------------------
// Inbound XML
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub to_user_name: String,
    pub from_user_name: String,
    pub msg_type: String,
    pub content: Option<String>,
    pub event: Option<String>,
}

/// Flat tag→value scan of the webhook XML, CDATA-aware. Returns `None` when
/// any of the required fields is missing, which callers treat as malformed.
pub fn parse_message(xml: &str) -> Option<IncomingMessage> {
    let get_value = |tag: &str| -> Option<String> {
        let start_tag = format!("<{}>", tag);
        let end_tag = format!("</{}>", tag);
        let start = xml.find(&start_tag)?;
        let end = xml.find(&end_tag)?;
        let value_start = start + start_tag.len();
        if value_start > end {
            return None;
        }
        let value = &xml[value_start..end];
        if let Some(inner) = value
            .strip_prefix("<![CDATA[")
            .and_then(|v| v.strip_suffix("]]>"))
        {
            Some(inner.to_string())
        } else {
            Some(value.to_string())
        }
    };

    Some(IncomingMessage {
        to_user_name: get_value("ToUserName")?,
        from_user_name: get_value("FromUserName")?,
        msg_type: get_value("MsgType")?,
        content: get_value("Content"),
        event: get_value("Event"),
    })
}

/// Render the fixed-shape text reply envelope with From/To swapped relative
/// to the inbound message and the content cut at the channel limit.
pub fn build_text_reply(inbound: &IncomingMessage, content: &str) -> String {
    let content: String = content.chars().take(REPLY_CHAR_LIMIT).collect();
    format!(
        r#"<xml>
<ToUserName><![CDATA[{}]]></ToUserName>
<FromUserName><![CDATA[{}]]></FromUserName>
<CreateTime>{}</CreateTime>
<MsgType><![CDATA[text]]></MsgType>
<Content><![CDATA[{}]]></Content>
</xml>"#,
        inbound.from_user_name,
        inbound.to_user_name,
        Utc::now().timestamp(),
        content
    )
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WeChat expects an empty 200 body to mean "ignore".
fn empty_response() -> Response {
    StatusCode::OK.into_response()
}

// ---------------------------------------------------------------------------
// Message dispatch
// ---------------------------------------------------------------------------

async fn handle_message(State(state): State<Arc<AppState>>, body: String) -> Response {
    let message = match parse_message(&body) {
        Some(message) => message,
        None => {
            error!("invalid wechat message format: {}", body);
            return empty_response();
        }
    };

    info!(
        "processing wechat message, msg_type={} from_user={}",
        message.msg_type, message.from_user_name
    );

    match message.msg_type.as_str() {
        "text" => handle_text_message(&state, &message).await,
        "event" => handle_event_message(&state, &message).await,
        other => {
            info!("unsupported wechat message type: {}", other);
            xml_response(build_text_reply(&message, "暂不支持该类型消息"))
        }
    }
}

async fn handle_text_message(state: &Arc<AppState>, message: &IncomingMessage) -> Response {
    let content = match message.content.as_deref() {
        Some(content) if !content.is_empty() => content,
        _ => {
            warn!("wechat text message without content");
            return empty_response();
        }
    };

    let session_id = resolve_session_id(state, &message.from_user_name).await;
    let user = match touch_user(state, &message.from_user_name, &session_id).await {
        Ok(user) => user,
        Err(e) => {
            error!("failed to upsert wechat user: {:#}", e);
            return empty_response();
        }
    };

    let outcome = ai::answer_question(state, content, user.id, true).await;
    xml_response(build_text_reply(message, &outcome.answer))
}

async fn handle_event_message(state: &Arc<AppState>, message: &IncomingMessage) -> Response {
    match message.event.as_deref() {
        Some("subscribe") => {
            if let Err(e) = subscribe_user(state, &message.from_user_name).await {
                error!("failed to record subscribe event: {:#}", e);
            }
            xml_response(build_text_reply(
                message,
                "欢迎关注家政AI知识库！\n\n请输入您的问题，我将为您提供专业的家政咨询服务。",
            ))
        }
        Some("unsubscribe") => {
            if let Err(e) =
                set_user_status(state, &message.from_user_name, WECHAT_STATUS_UNFOLLOWED).await
            {
                error!("failed to record unsubscribe event: {:#}", e);
            }
            empty_response()
        }
        Some(event) => xml_response(build_text_reply(message, &format!("收到事件：{}", event))),
        None => {
            warn!("wechat event message without Event field");
            empty_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Users and sessions
// ---------------------------------------------------------------------------

/// Per-user session token with a 7-day cache lifetime. Concurrent webhook
/// deliveries for a brand-new user may both write; last write wins, which is
/// accepted behavior. Without a cache the id is per-request only.
async fn resolve_session_id(state: &Arc<AppState>, openid: &str) -> String {
    let Some(cache) = &state.cache else {
        return random_token(SESSION_ID_LENGTH);
    };
    let key = format!("wechat_session_{}", openid);

    let mut conn = match cache.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("cache unavailable for wechat session: {}", e);
            return random_token(SESSION_ID_LENGTH);
        }
    };

    match redis::cmd("GET")
        .arg(&key)
        .query_async::<Option<String>>(&mut conn)
        .await
    {
        Ok(Some(existing)) => existing,
        _ => {
            let fresh = random_token(SESSION_ID_LENGTH);
            if let Err(e) = redis::cmd("SET")
                .arg(&key)
                .arg(&fresh)
                .arg("EX")
                .arg(SESSION_TTL_SECS)
                .query_async::<()>(&mut conn)
                .await
            {
                warn!("failed to cache wechat session id: {}", e);
            }
            fresh
        }
    }
}

/// Resolve or create the sender's row and refresh last_active. The session
/// id is only written on first creation; an existing row keeps its own.
async fn touch_user(
    state: &Arc<AppState>,
    openid: &str,
    session_id: &str,
) -> anyhow::Result<WeChatUser> {
    let pool = state.conn.clone();
    let row = NewWeChatUser {
        openid: openid.to_string(),
        session_id: Some(session_id.to_string()),
        last_active: Some(Utc::now()),
        status: WECHAT_STATUS_FOLLOWED,
    };
    let user = tokio::task::spawn_blocking(move || -> anyhow::Result<WeChatUser> {
        let mut conn = pool.get()?;
        let now = Utc::now();
        Ok(diesel::insert_into(wechat_users::table)
            .values(&row)
            .on_conflict(wechat_users::openid)
            .do_update()
            .set((
                wechat_users::last_active.eq(now),
                wechat_users::updated_at.eq(now),
            ))
            .returning(WeChatUser::as_returning())
            .get_result(&mut conn)?)
    })
    .await??;
    Ok(user)
}

/// Insert-or-refresh statement for a follower, keyed by openid. A repeated
/// subscribe event hits the conflict arm and never creates a second row.
fn subscribe_upsert(
    row: NewWeChatUser,
) -> impl diesel::query_dsl::methods::ExecuteDsl<PgConnection>
       + diesel::query_builder::QueryFragment<diesel::pg::Pg> {
    diesel::insert_into(wechat_users::table)
        .values(row)
        .on_conflict(wechat_users::openid)
        .do_update()
        .set((
            wechat_users::status.eq(WECHAT_STATUS_FOLLOWED),
            wechat_users::updated_at.eq(Utc::now()),
        ))
}

/// Upsert keyed by openid with status forced to followed; repeated
/// subscribe events are idempotent. Profile details are refreshed
/// best-effort when an access token is available.
async fn subscribe_user(state: &Arc<AppState>, openid: &str) -> anyhow::Result<()> {
    let pool = state.conn.clone();
    let row = NewWeChatUser {
        openid: openid.to_string(),
        session_id: None,
        last_active: Some(Utc::now()),
        status: WECHAT_STATUS_FOLLOWED,
    };
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(diesel::query_dsl::methods::ExecuteDsl::execute(
            subscribe_upsert(row),
            &mut conn,
        )?)
    })
    .await??;

    if let Some(token) = access_token(state).await {
        match fetch_user_info(state, &token, openid).await {
            Ok(profile) => {
                if let Err(e) = apply_profile(state, openid, &profile).await {
                    warn!("failed to store wechat profile for {}: {:#}", openid, e);
                }
            }
            Err(e) => warn!("failed to fetch wechat profile for {}: {}", openid, e),
        }
    }
    Ok(())
}

async fn set_user_status(state: &Arc<AppState>, openid: &str, status: i16) -> anyhow::Result<()> {
    let pool = state.conn.clone();
    let openid = openid.to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(
            diesel::update(wechat_users::table.filter(wechat_users::openid.eq(&openid)))
                .set((
                    wechat_users::status.eq(status),
                    wechat_users::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)?,
        )
    })
    .await??;
    Ok(())
}

// ---------------------------------------------------------------------------
// Access token and profile lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    errcode: Option<i32>,
    errmsg: Option<String>,
}

/// Cache TTL for a fresh token: declared expiry minus the safety margin.
/// A declared expiry at or under the margin is rejected outright.
pub fn token_cache_ttl(expires_in: i64) -> Option<i64> {
    let ttl = expires_in - TOKEN_EXPIRY_MARGIN_SECS;
    (ttl > 0).then_some(ttl)
}

/// Lazily refreshed access token. Every failure path (missing appSecret,
/// network error, provider errcode, useless expiry) yields `None`; callers
/// treat that as retry-later, never as fatal.
pub async fn access_token(state: &Arc<AppState>) -> Option<String> {
    let mut cache_conn = match &state.cache {
        Some(cache) => cache.get_multiplexed_async_connection().await.ok(),
        None => None,
    };

    if let Some(conn) = cache_conn.as_mut() {
        if let Ok(Some(token)) = redis::cmd("GET")
            .arg(ACCESS_TOKEN_CACHE_KEY)
            .query_async::<Option<String>>(conn)
            .await
        {
            if !token.is_empty() {
                return Some(token);
            }
        }
    }

    let Some(app_secret) = &state.config.wechat.app_secret else {
        error!("wechat appSecret is not configured");
        return None;
    };

    let url = format!(
        "{}/cgi-bin/token?grant_type=client_credential&appid={}&secret={}",
        state.config.wechat.api_base_url, state.config.wechat.app_id, app_secret
    );
    let response = match state.http.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("wechat token request failed: {}", e);
            return None;
        }
    };
    let decoded: AccessTokenResponse = match response.json().await {
        Ok(decoded) => decoded,
        Err(e) => {
            error!("malformed wechat token response: {}", e);
            return None;
        }
    };

    if let Some(errcode) = decoded.errcode.filter(|&c| c != 0) {
        error!(
            "wechat token endpoint errcode {}: {}",
            errcode,
            decoded.errmsg.unwrap_or_default()
        );
        return None;
    }

    let (token, expires_in) = match (decoded.access_token, decoded.expires_in) {
        (Some(token), Some(expires_in)) if !token.is_empty() => (token, expires_in),
        _ => {
            error!("wechat token response missing access_token/expires_in");
            return None;
        }
    };
    let ttl = token_cache_ttl(expires_in)?;

    if let Some(conn) = cache_conn.as_mut() {
        if let Err(e) = redis::cmd("SET")
            .arg(ACCESS_TOKEN_CACHE_KEY)
            .arg(&token)
            .arg("EX")
            .arg(ttl)
            .query_async::<()>(conn)
            .await
        {
            warn!("failed to cache wechat access token: {}", e);
        }
    }
    Some(token)
}

#[derive(Debug, Deserialize)]
pub struct WeChatProfile {
    pub errcode: Option<i32>,
    pub errmsg: Option<String>,
    pub nickname: Option<String>,
    pub sex: Option<i16>,
    pub language: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub country: Option<String>,
    pub headimgurl: Option<String>,
    pub unionid: Option<String>,
}

async fn fetch_user_info(
    state: &Arc<AppState>,
    access_token: &str,
    openid: &str,
) -> Result<WeChatProfile, crate::shared::error::UpstreamError> {
    let url = format!(
        "{}/cgi-bin/user/info?access_token={}&openid={}&lang=zh_CN",
        state.config.wechat.api_base_url, access_token, openid
    );
    let response = state.http.get(&url).send().await?;
    let profile: WeChatProfile = response
        .json()
        .await
        .map_err(|e| crate::shared::error::UpstreamError::Decode(e.to_string()))?;
    if let Some(errcode) = profile.errcode.filter(|&c| c != 0) {
        return Err(crate::shared::error::UpstreamError::Decode(format!(
            "errcode {}: {}",
            errcode,
            profile.errmsg.unwrap_or_default()
        )));
    }
    Ok(profile)
}

/// Merge fetched profile fields into the row, keeping existing values where
/// the provider sent nothing.
async fn apply_profile(
    state: &Arc<AppState>,
    openid: &str,
    profile: &WeChatProfile,
) -> anyhow::Result<()> {
    let pool = state.conn.clone();
    let openid = openid.to_string();
    let nickname = profile.nickname.clone();
    let avatar = profile.headimgurl.clone();
    let gender = profile.sex;
    let country = profile.country.clone();
    let province = profile.province.clone();
    let city = profile.city.clone();
    let language = profile.language.clone();
    let unionid = profile.unionid.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(
            diesel::update(wechat_users::table.filter(wechat_users::openid.eq(&openid)))
                .set((
                    wechat_users::nickname.eq(nickname),
                    wechat_users::avatar.eq(avatar),
                    wechat_users::gender.eq(gender),
                    wechat_users::country.eq(country),
                    wechat_users::province.eq(province),
                    wechat_users::city.eq(city),
                    wechat_users::language.eq(language),
                    wechat_users::unionid.eq(unionid),
                    wechat_users::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)?,
        )
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // sorted concat of ("default_token", "1", "2") is "12default_token"
        assert!(verify_signature(
            "default_token",
            "1",
            "2",
            "9dfe8345a8242379d2a67eaeca4532c8697bd82e"
        ));
        assert!(!verify_signature(
            "default_token",
            "1",
            "2",
            "0000000000000000000000000000000000000000"
        ));
    }

    #[test]
    fn signature_sorts_lexicographically() {
        // concat is "1700000000" + "abc123" + "secret_token"
        assert!(verify_signature(
            "secret_token",
            "1700000000",
            "abc123",
            "ed1060f53da1822b42d7ca4a2a2b5c00e9aaeca6"
        ));
    }

    #[test]
    fn parses_cdata_text_message() {
        let xml = "<xml>\
            <ToUserName><![CDATA[gh_account]]></ToUserName>\
            <FromUserName><![CDATA[openid123]]></FromUserName>\
            <CreateTime>1700000000</CreateTime>\
            <MsgType><![CDATA[text]]></MsgType>\
            <Content><![CDATA[你好]]></Content>\
            </xml>";
        let message = parse_message(xml).unwrap();
        assert_eq!(message.msg_type, "text");
        assert_eq!(message.from_user_name, "openid123");
        assert_eq!(message.to_user_name, "gh_account");
        assert_eq!(message.content.as_deref(), Some("你好"));
        assert!(message.event.is_none());
    }

    #[test]
    fn missing_required_field_is_malformed() {
        assert!(parse_message("<xml><MsgType><![CDATA[text]]></MsgType></xml>").is_none());
        assert!(parse_message("not xml").is_none());
    }

    #[test]
    fn reply_swaps_from_and_to() {
        let inbound = IncomingMessage {
            to_user_name: "gh_account".to_string(),
            from_user_name: "openid123".to_string(),
            msg_type: "text".to_string(),
            content: Some("q".to_string()),
            event: None,
        };
        let reply = build_text_reply(&inbound, "answer");
        assert!(reply.contains("<ToUserName><![CDATA[openid123]]></ToUserName>"));
        assert!(reply.contains("<FromUserName><![CDATA[gh_account]]></FromUserName>"));
        assert!(reply.contains("<Content><![CDATA[answer]]></Content>"));
    }

    #[test]
    fn reply_content_is_cut_at_limit_on_char_boundary() {
        let inbound = IncomingMessage {
            to_user_name: "a".to_string(),
            from_user_name: "b".to_string(),
            msg_type: "text".to_string(),
            content: None,
            event: None,
        };
        let long = "界".repeat(600);
        let reply = build_text_reply(&inbound, &long);
        let start = reply.find("<Content><![CDATA[").unwrap() + "<Content><![CDATA[".len();
        let end = reply.find("]]></Content>").unwrap();
        assert_eq!(reply[start..end].chars().count(), REPLY_CHAR_LIMIT);
    }

    #[test]
    fn subscribe_statement_upserts_on_openid() {
        let row = NewWeChatUser {
            openid: "openid123".to_string(),
            session_id: None,
            last_active: None,
            status: WECHAT_STATUS_FOLLOWED,
        };
        let sql = diesel::debug_query::<diesel::pg::Pg, _>(&subscribe_upsert(row)).to_string();
        assert!(sql.contains("INSERT INTO \"wechat_users\""));
        assert!(sql.contains("ON CONFLICT (\"openid\")"));
        assert!(sql.contains("DO UPDATE"));
        assert!(sql.contains("\"status\" = "));
    }

    #[test]
    fn token_ttl_applies_safety_margin() {
        assert_eq!(token_cache_ttl(7200), Some(6600));
        assert_eq!(token_cache_ttl(601), Some(1));
        assert_eq!(token_cache_ttl(600), None);
        assert_eq!(token_cache_ttl(0), None);
        assert_eq!(token_cache_ttl(-5), None);
    }
}
