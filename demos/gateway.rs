use std::sync::Arc;

use axum::{
    extract::FromRef,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gateway_jwt_auth::{
    protected_resource_router, AuthenticationPipeline, Authenticated, Config,
};
use serde_json::{json, Value};

#[derive(Clone, FromRef)]
struct AppState {
    pipeline: Arc<AuthenticationPipeline>,
}

// Serves its own JWKS so the demo runs offline. In a real deployment the keys come from the
// identity provider.
async fn jwks_handler() -> Json<Value> {
    Json(json!({
        "keys": [{
            "kty": "oct",
            "use": "sig",
            "alg": "HS256",
            "kid": "demo-key",
            "k": "Z2F0ZXdheS1qd3QtYXV0aC10ZXN0LXNlY3JldC0wMTIzNDU2Nzg5YWJjZGVmZ2hp"
        }]
    }))
}

async fn user_info(Authenticated(claims): Authenticated) -> Response {
    Json(claims).into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let jwks = Router::new().route("/.well-known/jwks.json", get(jwks_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3001")
        .await
        .expect("Failed to bind JWKS server");
    tokio::spawn(async move {
        axum::serve(listener, jwks)
            .await
            .expect("Failed to start JWKS server");
    });

    let config = Config::from_json(
        br#"{
            "url": "http://127.0.0.1:3001/.well-known/jwks.json",
            "poll_interval": 30,
            "locations": [
                {"type": "header", "name": "Authorization", "value_prefix": "Bearer "},
                {"type": "cookie", "name": "auth-token"}
            ],
            "oauth": {
                "protected_resource": {
                    "metadata": {
                        "resource": "http://127.0.0.1:3000",
                        "scopes_supported": ["profile"]
                    }
                }
            }
        }"#,
    )
    .expect("Invalid configuration");

    let state = AppState {
        pipeline: Arc::new(
            AuthenticationPipeline::from_config(config)
                .await
                .expect("Failed to initialize authentication"),
        ),
    };

    let app = Router::new()
        .route("/user_info", get(user_info))
        .merge(protected_resource_router(&state.pipeline))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .expect("Failed to bind server");
    println!("Listening on http://127.0.0.1:3000/user_info");
    axum::serve(listener, app).await.expect("Failed to start server");
}
