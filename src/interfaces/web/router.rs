use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use super::AppState;
use super::auth;
use super::handlers::{data, jobs, query};

pub(crate) fn build_cors(api_port: u16, configured: &[String]) -> CorsLayer {
    let candidates: Vec<String> = if configured.is_empty() {
        vec![
            format!("http://127.0.0.1:{}", api_port),
            format!("http://localhost:{}", api_port),
        ]
    } else {
        configured.to_vec()
    };
    let origins: Vec<HeaderValue> = candidates
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState, cors: CorsLayer) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let authed_routes = Router::new()
        .route("/api/query/{name}", post(query::query_endpoint))
        .route("/api/query/{name}/map", post(query::query_map_endpoint))
        .route("/api/query/{name}/array", post(query::query_array_endpoint))
        .route("/api/exec/{name}", post(query::exec_endpoint))
        .route(
            "/api/data/{table}",
            post(data::create_endpoint)
                .patch(data::update_endpoint)
                .delete(data::delete_endpoint),
        )
        .route("/api/data/{table}/{id}", get(data::load_endpoint))
        .route("/api/jobs", get(jobs::list_jobs_endpoint))
        .route("/api/jobs/start", post(jobs::start_job_endpoint))
        .route("/api/jobs/stop", post(jobs::stop_job_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_identity));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::web::testing::{TENANT_TOKEN, TestApp, test_app};
    use axum::http::StatusCode;
    use serde_json::Value;
    use tower::util::ServiceExt;

    fn app(env: &TestApp) -> Router {
        build_api_router(env.state.clone(), build_cors(17990, &[]))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn tenant_json(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("app_id", "p1")
            .header("token", TENANT_TOKEN)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin_json(env: &TestApp, method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("app_id", "default")
            .header("token", &env.admin_key)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public_and_hardened() {
        let env = test_app().await;
        let resp = app(&env)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn query_map_pages_and_sorts() {
        let env = test_app().await;
        let req = tenant_json(
            Method::POST,
            "/api/query/orders_over/map",
            json!({"params": [5], "page": 1, "limit": 2, "sort": "total", "dir": "desc"}),
        );
        let (status, body) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["total_rows"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["page_size"], 2);
        assert_eq!(body["data_array"][0]["id"], "c");
        assert_eq!(body["data_array"][1]["id"], "b");
    }

    #[tokio::test]
    async fn out_of_range_paging_is_a_bad_request() {
        let env = test_app().await;
        for body in [
            json!({"params": [5], "page": 1, "limit": i64::MAX}),
            json!({"params": [5], "page": i64::MAX, "limit": 1000}),
        ] {
            let req = tenant_json(Method::POST, "/api/query/orders_over/map", body);
            let (status, body) = send(app(&env), req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
            assert!(body["err"].is_string());
        }
    }

    #[tokio::test]
    async fn malformed_bodies_get_the_error_envelope() {
        let env = test_app().await;
        for uri in ["/api/query/orders_over/map", "/api/exec/mark_paid", "/api/data/orders"] {
            let req = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("app_id", "p1")
                .header("token", TENANT_TOKEN)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"params\": [5"))
                .unwrap();
            let (status, body) = send(app(&env), req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["err"].as_str().unwrap().starts_with("Invalid JSON body"), "{}", body);
        }
    }

    #[tokio::test]
    async fn query_mode_in_body_picks_the_shape() {
        let env = test_app().await;
        let req = tenant_json(Method::POST, "/api/query/orders_over", json!({"params": [25], "mode": "array"}));
        let (status, body) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["headers"], json!(["id", "total"]));
        assert_eq!(body["data_array"], json!([["c", 30]]));

        let req = tenant_json(Method::POST, "/api/query/orders_over", json!({"params": [25], "mode": "grid"}));
        let (status, body) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["err"].as_str().unwrap().contains("grid"));
    }

    #[tokio::test]
    async fn param_count_mismatch_is_400_with_the_message() {
        let env = test_app().await;
        let req = tenant_json(Method::POST, "/api/query/orders_over/array", json!({"params": []}));
        let (status, body) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["err"], "Incorrect param count. Expected: 1 actual: 0");
    }

    #[tokio::test]
    async fn unknown_query_is_404() {
        let env = test_app().await;
        let req = tenant_json(Method::POST, "/api/query/missing/map", json!({}));
        let (status, _) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exec_reports_counts_per_row() {
        let env = test_app().await;
        let req = tenant_json(
            Method::POST,
            "/api/exec/mark_paid",
            json!({"params": [["a"], ["zz"]]}),
        );
        let (status, body) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data_array"], json!([[1], [0]]));
        assert_eq!(body["total_rows"], 2);
    }

    #[tokio::test]
    async fn crud_round_over_http() {
        let env = test_app().await;
        let (status, created) = send(
            app(&env),
            tenant_json(Method::POST, "/api/data/orders", json!({"id": "d", "total": 40, "status": "new"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", created);
        assert_eq!(created[0]["id"], "d");

        let (status, _) = send(
            app(&env),
            tenant_json(Method::PATCH, "/api/data/orders", json!([{"id": "d", "status": "paid"}])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::get("/api/data/orders/d")
            .header("app_id", "p1")
            .header("token", TENANT_TOKEN)
            .body(Body::empty())
            .unwrap();
        let (status, loaded) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(loaded["status"], "paid");

        let (status, deleted) = send(
            app(&env),
            tenant_json(Method::DELETE, "/api/data/orders", json!({"ids": ["d"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], 1);
    }

    #[tokio::test]
    async fn table_outside_token_targets_is_403() {
        let env = test_app().await;
        let (status, body) = send(
            app(&env),
            tenant_json(Method::POST, "/api/data/invoices", json!({"id": "i1"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["err"], "Access denied.");
    }

    #[tokio::test]
    async fn admin_starts_and_stops_a_job() {
        let env = test_app().await;
        let scheduler = env.state.scheduler.clone().unwrap();

        let (status, body) = send(
            app(&env),
            admin_json(&env, Method::POST, "/api/jobs/start", json!({"job_id": env.job_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["changed"], true);
        assert!(scheduler.is_registered(&env.job_id).await);

        let (_, listed) = send(app(&env), admin_json(&env, Method::GET, "/api/jobs", json!({}))).await;
        assert_eq!(listed["jobs"][0]["status"], "running");
        assert_eq!(listed["jobs"][0]["registered"], true);

        let (status, body) = send(
            app(&env),
            admin_json(&env, Method::POST, "/api/jobs/stop", json!({"job_id": env.job_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert!(!scheduler.is_registered(&env.job_id).await);
    }

    #[tokio::test]
    async fn tenant_without_x_on_job_cannot_toggle_it() {
        let env = test_app().await;
        let (status, _) = send(
            app(&env),
            tenant_json(Method::POST, "/api/jobs/start", json!({"job_id": env.job_id})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            app(&env),
            tenant_json(Method::POST, "/api/jobs/start", json!({"job_id": "unknown"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_require_the_admin_tenant() {
        let env = test_app().await;
        let req = Request::get("/api/logs")
            .header("app_id", "p1")
            .header("token", TENANT_TOKEN)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&env), req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
