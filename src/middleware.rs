use axum::{extract::MatchedPath, http::Request};
use tower_http::trace::MakeSpan;
use tracing::Span;

/// Request span carrying the deployment env and instance id.
#[derive(Clone)]
pub struct InstanceRequestSpan {
    env: String,
    instance_id: String,
}

impl InstanceRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for InstanceRequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let matched_path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|matched_path| matched_path.as_str());
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %req.method(),
            uri = %req.uri(),
            matched_path,
        )
    }
}
