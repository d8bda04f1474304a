use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::super::AppState;
use super::super::auth::ClientIp;
use super::super::error::{ApiResult, JsonBody};
use crate::core::auth::Identity;

/// One row or a list of rows.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Rows {
    One(Map<String, Value>),
    Many(Vec<Map<String, Value>>),
}

impl Rows {
    fn into_vec(self) -> Vec<Map<String, Value>> {
        match self {
            Rows::One(row) => vec![row],
            Rows::Many(rows) => rows,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    ids: Vec<String>,
}

pub async fn create_endpoint(
    Path(table): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    rows: JsonBody<Rows>,
) -> ApiResult<Json<Value>> {
    let Json(rows) = rows?;
    Ok(Json(state.operator.create(identity, ip.0, &table, rows.into_vec()).await?))
}

pub async fn load_endpoint(
    Path((table, id)): Path<(String, String)>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.operator.load(identity, ip.0, &table, &id).await?))
}

pub async fn update_endpoint(
    Path(table): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    rows: JsonBody<Rows>,
) -> ApiResult<Json<Value>> {
    let Json(rows) = rows?;
    Ok(Json(state.operator.update(identity, ip.0, &table, rows.into_vec()).await?))
}

pub async fn delete_endpoint(
    Path(table): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    body: JsonBody<DeleteBody>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    Ok(Json(state.operator.delete(identity, ip.0, &table, body.ids).await?))
}
