use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::Value;

use super::super::AppState;
use super::super::auth::ClientIp;
use super::super::error::{ApiError, ApiResult, JsonBody};
use crate::core::auth::Identity;
use crate::core::error::CoreError;
use crate::core::executor::{Paging, SortDir};
use crate::core::operator::{ExecRequest, ExecResponse, QueryRequest, QueryResponse};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueryBody {
    query_params: Vec<String>,
    params: Vec<Value>,
    page: Option<i64>,
    limit: Option<i64>,
    sort: Option<String>,
    dir: Option<String>,
    /// `map` (default) or `array`; only read by `POST /api/query/{name}`.
    mode: Option<String>,
}

impl QueryBody {
    fn paging(&self) -> ApiResult<Option<Paging>> {
        if self.page.is_none() && self.limit.is_none() && self.sort.is_none() {
            return Ok(None);
        }
        let mut paging = Paging::checked(self.page, self.limit)?;
        if let Some(column) = self.sort.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let dir = SortDir::parse(self.dir.as_deref().unwrap_or(""))?;
            paging.sort = Some((column.to_string(), dir));
        }
        Ok(Some(paging))
    }

    fn into_request(self, name: String) -> ApiResult<QueryRequest> {
        let paging = self.paging()?;
        Ok(QueryRequest {
            name,
            query_params: self.query_params,
            params: self.params,
            paging,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecBody {
    query_params: Vec<String>,
    params: Vec<Vec<Value>>,
}

pub async fn query_map_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    body: JsonBody<QueryBody>,
) -> ApiResult<Json<QueryResponse>> {
    let Json(body) = body?;
    let request = body.into_request(name)?;
    Ok(Json(state.operator.query_map(identity, ip.0, request).await?))
}

pub async fn query_array_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    body: JsonBody<QueryBody>,
) -> ApiResult<Json<QueryResponse>> {
    let Json(body) = body?;
    let request = body.into_request(name)?;
    Ok(Json(state.operator.query_array(identity, ip.0, request).await?))
}

/// Shape picked by the body's `mode` field.
pub async fn query_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    body: JsonBody<QueryBody>,
) -> ApiResult<Json<QueryResponse>> {
    let Json(mut body) = body?;
    let mode = body.mode.take().unwrap_or_default().to_ascii_lowercase();
    let request = body.into_request(name)?;
    let response = match mode.as_str() {
        "" | "map" => state.operator.query_map(identity, ip.0, request).await?,
        "array" => state.operator.query_array(identity, ip.0, request).await?,
        other => {
            return Err(ApiError(CoreError::Validation(format!("Unknown query mode: {}", other))));
        }
    };
    Ok(Json(response))
}

pub async fn exec_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(ip): Extension<ClientIp>,
    body: JsonBody<ExecBody>,
) -> ApiResult<Json<ExecResponse>> {
    let Json(body) = body?;
    let request = ExecRequest {
        name,
        query_params: body.query_params,
        params: body.params,
    };
    Ok(Json(state.operator.exec(identity, ip.0, request).await?))
}
