//! Admin knowledge-base CRUD.
//!
//! Every mutation is forwarded to the vector index so retrieval stays in
//! step with the relational rows. The two stores share no transaction; an
//! index failure leaves the row authoritative and is logged for manual
//! reconciliation.

use crate::auth::AuthUser;
use crate::shared::error::ApiError;
use crate::shared::models::{schema::knowledge_entries, KnowledgeEntry, NewKnowledgeEntry};
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/knowledge", get(index).post(store))
        .route("/admin/knowledge/update", post(update))
        .route("/admin/knowledge/delete", post(delete))
}

#[derive(Debug, Deserialize)]
pub struct KnowledgePayload {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePayload {
    pub id: i64,
    #[serde(flatten)]
    pub entry: KnowledgePayload,
}

#[derive(Debug, Deserialize)]
pub struct DeletePayload {
    pub id: i64,
}

async fn index(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
) -> Result<Json<Vec<KnowledgeEntry>>, ApiError> {
    let pool = state.conn.clone();
    let entries = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<KnowledgeEntry>> {
        let mut conn = pool.get()?;
        Ok(knowledge_entries::table
            .order(knowledge_entries::id.asc())
            .select(KnowledgeEntry::as_select())
            .load(&mut conn)?)
    })
    .await
    .map_err(anyhow::Error::from)??;
    Ok(Json(entries))
}

async fn store(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Json(payload): Json<KnowledgePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = NewKnowledgeEntry {
        title: payload.title,
        content: payload.content,
        category: category_or_default(payload.category, &state.config.system_mode),
        tags: serde_json::to_value(&payload.tags).unwrap_or_else(|_| json!([])),
    };
    let entry = insert_entry(&state.conn, row).await?;

    if let Err(e) = state.vector.add_doc(entry.id, &entry.content).await {
        error!(
            "knowledge entry {} stored but vector indexing failed: {}",
            entry.id, e
        );
    }

    Ok(Json(json!({ "status": "ok", "id": entry.id })))
}

async fn update(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Json(payload): Json<UpdatePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.conn.clone();
    let entry_id = payload.id;
    let KnowledgePayload {
        title,
        content,
        tags,
        category,
    } = payload.entry;
    let category = category_or_default(category, &state.config.system_mode);
    let updated = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<KnowledgeEntry>> {
        let mut conn = pool.get()?;
        let changed = diesel::update(knowledge_entries::table.find(entry_id))
            .set((
                knowledge_entries::title.eq(&title),
                knowledge_entries::content.eq(&content),
                knowledge_entries::category.eq(&category),
                knowledge_entries::tags
                    .eq(serde_json::to_value(&tags).unwrap_or_else(|_| json!([]))),
                knowledge_entries::updated_at.eq(Utc::now()),
            ))
            .returning(KnowledgeEntry::as_returning())
            .get_result(&mut conn)
            .optional()?;
        Ok(changed)
    })
    .await
    .map_err(anyhow::Error::from)??
    .ok_or_else(|| ApiError::NotFound("knowledge entry".to_string()))?;

    if let Err(e) = state.vector.update_doc(updated.id, &updated.content).await {
        error!(
            "knowledge entry {} updated but vector re-indexing failed: {}",
            updated.id, e
        );
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn delete(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Json(payload): Json<DeletePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.conn.clone();
    let entry_id = payload.id;
    let removed = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let mut conn = pool.get()?;
        Ok(diesel::delete(knowledge_entries::table.find(entry_id)).execute(&mut conn)?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    if removed == 0 {
        return Err(ApiError::NotFound("knowledge entry".to_string()));
    }

    if let Err(e) = state.vector.delete_doc(entry_id).await {
        error!(
            "knowledge entry {} deleted but vector removal failed: {}",
            entry_id, e
        );
    }

    Ok(Json(json!({ "status": "ok" })))
}

/// Category fallback applied uniformly: store, update and the curation
/// pipeline all substitute the configured system mode for a missing one.
pub(crate) fn category_or_default(category: Option<String>, default: &str) -> String {
    category.unwrap_or_else(|| default.to_string())
}

/// Shared insert used by the admin endpoint and the curation pipeline.
pub async fn insert_entry(
    pool: &DbPool,
    row: NewKnowledgeEntry,
) -> Result<KnowledgeEntry, ApiError> {
    let pool = pool.clone();
    let entry = tokio::task::spawn_blocking(move || -> anyhow::Result<KnowledgeEntry> {
        let mut conn = pool.get()?;
        Ok(diesel::insert_into(knowledge_entries::table)
            .values(&row)
            .returning(KnowledgeEntry::as_returning())
            .get_result(&mut conn)?)
    })
    .await
    .map_err(anyhow::Error::from)??;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_category_falls_back_to_system_mode() {
        assert_eq!(category_or_default(None, "general"), "general");
    }

    #[test]
    fn explicit_category_is_kept() {
        assert_eq!(
            category_or_default(Some("清洁".to_string()), "general"),
            "清洁"
        );
    }
}
