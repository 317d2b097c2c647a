use crate::backend::{Backend, RateLimitDecision, SlidingWindowInput, Unavailable};
use crate::store::RestStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const PROCEDURE: &str = "check_rate_limit";

/// A sliding window [Backend] that delegates to the `check_rate_limit` stored procedure.
///
/// The procedure performs the prune, count, record and expire steps in one transaction and
/// returns `{allowed, remaining, reset_at}`. `reset_at` (or `resetAt`) must be epoch
/// milliseconds; when it is absent the window end is approximated as `now + window`. Any other
/// representation, such as a `timestamptz` string, makes the reply malformed and the tier is
/// skipped.
#[derive(Clone, Debug)]
pub struct DatabaseBackend {
    store: RestStore,
}

#[derive(Debug, Serialize)]
struct ProcedureArgs<'a> {
    p_key: &'a str,
    p_limit: u64,
    p_window_seconds: u64,
    p_now_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ProcedureRow {
    allowed: bool,
    remaining: i64,
    /// Epoch milliseconds.
    #[serde(default, alias = "resetAt")]
    reset_at: Option<u64>,
}

/// Depending on how the procedure is declared the store returns a bare object or a row set.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProcedureReply {
    Row(ProcedureRow),
    Rows(Vec<ProcedureRow>),
}

impl DatabaseBackend {
    pub fn new(store: RestStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Backend for DatabaseBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn request(
        &self,
        input: &SlidingWindowInput,
        now_millis: u64,
    ) -> Result<RateLimitDecision, Unavailable> {
        let args = ProcedureArgs {
            p_key: &input.key,
            p_limit: input.max_requests,
            p_window_seconds: input.interval.as_secs(),
            p_now_ms: now_millis,
        };
        let reply: ProcedureReply = self.store.rpc(PROCEDURE, &args).await?;
        let row = match reply {
            ProcedureReply::Row(row) => row,
            ProcedureReply::Rows(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| Unavailable::Malformed("empty row set".to_string()))?,
        };
        Ok(RateLimitDecision {
            allowed: row.allowed,
            remaining: row.remaining.max(0) as u64,
            reset_at: row.reset_at.unwrap_or_else(|| input.window_end(now_millis)),
            limit: input.max_requests,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{authorized, serve, SERVICE_KEY};
    use actix_web::{web, App, HttpRequest, HttpResponse};
    use serde_json::{json, Value};
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000_000;

    fn input() -> SlidingWindowInput {
        SlidingWindowInput {
            interval: Duration::from_secs(60),
            max_requests: 3,
            key: "ratelimit:t1:dev-A".to_string(),
        }
    }

    async fn procedure(req: HttpRequest, args: web::Json<Value>) -> HttpResponse {
        if !authorized(&req) {
            return HttpResponse::Unauthorized().finish();
        }
        let expected = json!({
            "p_key": "ratelimit:t1:dev-A",
            "p_limit": 3,
            "p_window_seconds": 60,
            "p_now_ms": NOW,
        });
        if args.into_inner() != expected {
            return HttpResponse::BadRequest().finish();
        }
        match req.match_info().get("shape") {
            Some("object") => HttpResponse::Ok().json(json!({
                "allowed": false, "remaining": -1, "reset_at": NOW + 1_000
            })),
            Some("rows") => HttpResponse::Ok().json(json!([{ "allowed": true, "remaining": 2 }])),
            Some("camel") => HttpResponse::Ok().json(json!({
                "allowed": true, "remaining": 1, "resetAt": NOW + 5_000
            })),
            Some("timestamptz") => HttpResponse::Ok().json(json!({
                "allowed": true, "remaining": 1, "reset_at": "2023-11-14T22:13:25+00:00"
            })),
            Some("empty") => HttpResponse::Ok().json(json!([])),
            _ => HttpResponse::Ok().json(json!({ "unexpected": true })),
        }
    }

    fn backend_for(shape: &'static str) -> DatabaseBackend {
        let url = serve!(|| {
            App::new().route(
                "/{shape}/rest/v1/rpc/check_rate_limit",
                web::post().to(procedure),
            )
        });
        let store = RestStore::new(&format!("{url}/{shape}"), SERVICE_KEY, Duration::from_secs(2))
            .unwrap();
        DatabaseBackend::new(store)
    }

    #[actix_web::test]
    async fn test_object_reply() {
        let decision = backend_for("object").request(&input(), NOW).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, NOW + 1_000);
        assert_eq!(decision.limit, 3);
    }

    #[actix_web::test]
    async fn test_row_set_reply() {
        let decision = backend_for("rows").request(&input(), NOW).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining, 2);
        // Missing reset falls back to the approximate window end
        assert_eq!(decision.reset_at, NOW + 60_000);
    }

    #[actix_web::test]
    async fn test_camel_case_reset() {
        let decision = backend_for("camel").request(&input(), NOW).await.unwrap();
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, NOW + 5_000);
    }

    #[actix_web::test]
    async fn test_timestamp_reset_is_unavailable() {
        let result = backend_for("timestamptz").request(&input(), NOW).await;
        assert!(matches!(result, Err(Unavailable::Malformed(_))));
    }

    #[actix_web::test]
    async fn test_shape_mismatch_is_unavailable() {
        let result = backend_for("empty").request(&input(), NOW).await;
        assert!(matches!(result, Err(Unavailable::Malformed(_))));
        let result = backend_for("other").request(&input(), NOW).await;
        assert!(matches!(result, Err(Unavailable::Malformed(_))));
    }
}
