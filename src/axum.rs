use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::pipeline::{AuthenticationPipeline, Unauthorized};
use crate::validator::ValidatedClaims;
use crate::ErrorKind;

/// The private claims of an authenticated request.
///
/// The router state must provide an `Arc<AuthenticationPipeline>` through [`FromRef`].
///
/// # Examples
///
/// ```ignore
/// async fn handler(Authenticated(claims): Authenticated) -> Response {
///     Json(claims).into_response()
/// }
///
/// let pipeline = Arc::new(AuthenticationPipeline::from_config(config).await?);
/// let app = Router::new()
///     .route("/me", get(handler))
///     .with_state(pipeline);
/// ```
#[derive(Debug, Clone)]
pub struct Authenticated(pub ValidatedClaims);

impl<S> FromRequestParts<S> for Authenticated
where
    Arc<AuthenticationPipeline>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let pipeline = Arc::<AuthenticationPipeline>::from_ref(state);

        pipeline
            .authenticate_claims(&parts.headers)
            .await
            .map(Authenticated)
            .map_err(|error| AuthRejection {
                headers: pipeline.unauthenticated_headers().clone(),
                error,
            })
    }
}

/// Routes serving the OAuth protected resource metadata document on its configured path.
/// Empty when no metadata is configured. The document is public: merge these routes outside
/// of anything requiring [`Authenticated`].
pub fn protected_resource_router<S>(pipeline: &AuthenticationPipeline) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let Some((path, document)) = pipeline.metadata_endpoint() else {
        return Router::new();
    };

    let document = document.clone();
    Router::new().route(
        path,
        get(move || {
            let document = document.clone();
            async move { Json(document) }
        }),
    )
}

/// Rejection for requests that fail authentication. Every failure kind is reported to the
/// client as `401 Unauthorized`; the kind itself is only exposed to the server.
#[derive(Debug)]
pub struct AuthRejection {
    headers: HeaderMap,
    error: Unauthorized,
}

impl AuthRejection {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn error(&self) -> &Unauthorized {
        &self.error
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.headers, "Unauthorized").into_response()
    }
}
