use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::users)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::api_tokens)]
pub struct NewApiToken {
    pub user_id: i64,
    pub token_hash: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = schema::knowledge_entries)]
pub struct KnowledgeEntry {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::knowledge_entries)]
pub struct NewKnowledgeEntry {
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::ai_chat_logs)]
pub struct NewChatLog {
    pub user_id: i64,
    pub question: String,
    pub answer: String,
    pub is_wechat: bool,
}

/// Status values for wechat_users.status.
pub const WECHAT_STATUS_UNFOLLOWED: i16 = 0;
pub const WECHAT_STATUS_FOLLOWED: i16 = 1;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::wechat_users)]
pub struct WeChatUser {
    pub id: i64,
    pub openid: String,
    pub unionid: Option<String>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub gender: Option<i16>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub language: Option<String>,
    pub session_id: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::wechat_users)]
pub struct NewWeChatUser {
    pub openid: String,
    pub session_id: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    pub status: i16,
}

pub mod schema {
    diesel::table! {
        users (id) {
            id -> Int8,
            name -> Text,
            email -> Text,
            password_hash -> Text,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        api_tokens (id) {
            id -> Int8,
            user_id -> Int8,
            token_hash -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        knowledge_entries (id) {
            id -> Int8,
            title -> Text,
            content -> Text,
            category -> Text,
            tags -> Jsonb,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        ai_chat_logs (id) {
            id -> Int8,
            user_id -> Int8,
            question -> Text,
            answer -> Text,
            is_wechat -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        wechat_users (id) {
            id -> Int8,
            openid -> Text,
            unionid -> Nullable<Text>,
            nickname -> Nullable<Text>,
            avatar -> Nullable<Text>,
            gender -> Nullable<Int2>,
            country -> Nullable<Text>,
            province -> Nullable<Text>,
            city -> Nullable<Text>,
            language -> Nullable<Text>,
            session_id -> Nullable<Text>,
            last_active -> Nullable<Timestamptz>,
            status -> Int2,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::joinable!(api_tokens -> users (user_id));
    diesel::allow_tables_to_appear_in_same_query!(users, api_tokens);
}
