//! API route definitions.

mod health;
mod skiers;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `POST /skiers/{resortID}/seasons/{seasonID}/days/{dayID}/skiers/{skierID}` - Record a lift ride
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/skiers/{resort_id}/seasons/{season_id}/days/{day_id}/skiers/{skier_id}",
            post(skiers::record_ride),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use chairlift_ingest::{ChannelPool, IngressGateway, MemoryBroker, PoolConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(config: PoolConfig) -> (MemoryBroker, Arc<IngressGateway>, Router) {
        let broker = MemoryBroker::new();
        let pool = Arc::new(ChannelPool::new(Arc::new(broker.clone()), config));
        let gateway = Arc::new(IngressGateway::new(pool, "lift_rides"));
        gateway.declare_queue().unwrap();
        let router = router(AppState::new(Arc::clone(&gateway)));
        (broker, gateway, router)
    }

    fn ride(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const VALID_URI: &str = "/skiers/3/seasons/2025/days/1/skiers/4242";
    const VALID_BODY: &str = r#"{"time": 217, "liftID": 21}"#;

    // =========================================================================
    // Ride submission
    // =========================================================================

    #[tokio::test]
    async fn test_valid_ride_is_published() {
        let (broker, _gateway, app) = app(PoolConfig::default());

        let response = app.oneshot(ride(VALID_URI, VALID_BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["queue"], "lift_rides");

        assert_eq!(broker.ready_count("lift_rides"), 1);
    }

    #[tokio::test]
    async fn test_invalid_path_is_bad_request() {
        let (broker, _gateway, app) = app(PoolConfig::default());

        for uri in [
            "/skiers/11/seasons/2025/days/1/skiers/1",
            "/skiers/1/seasons/2024/days/1/skiers/1",
            "/skiers/1/seasons/2025/days/0/skiers/1",
            "/skiers/1/seasons/2025/days/1/skiers/abc",
        ] {
            let response = app.clone().oneshot(ride(uri, VALID_BODY)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
        assert_eq!(broker.ready_count("lift_rides"), 0);
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let (_broker, _gateway, app) = app(PoolConfig::default());

        for body in ["", "{", r#"{"time": 400, "liftID": 1}"#, r#"{"time": 1}"#] {
            let response = app.clone().oneshot(ride(VALID_URI, body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{:?}", body);
            let json = json_body(response).await;
            assert_eq!(json["error"], "bad_request");
            assert!(json["message"].is_string());
        }
    }

    #[tokio::test]
    async fn test_exhausted_pool_returns_503() {
        let (_broker, gateway, app) = app(PoolConfig {
            max_total: 1,
            max_idle: 1,
            block_when_exhausted: false,
            max_wait: Duration::ZERO,
        });
        let pool = Arc::clone(gateway.pool());
        let (hold, release) = std::sync::mpsc::channel::<()>();
        let (held, ready) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let _channel = pool.borrow().unwrap();
            held.send(()).unwrap();
            release.recv().unwrap();
        });
        ready.recv().unwrap();

        let response = app.oneshot(ride(VALID_URI, VALID_BODY)).await.unwrap();
        hold.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn test_closed_pool_returns_500() {
        let (_broker, gateway, app) = app(PoolConfig::default());
        gateway.pool().close();

        let response = app.oneshot(ride(VALID_URI, VALID_BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // =========================================================================
    // Health
    // =========================================================================

    #[tokio::test]
    async fn test_health() {
        let (_broker, _gateway, app) = app(PoolConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"], "lift_rides");
    }
}
