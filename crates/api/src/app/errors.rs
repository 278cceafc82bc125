use std::str::FromStr;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use warden_core::WardenError;

pub fn warden_error_to_response(err: WardenError) -> Response {
    let message = err.to_string();
    match err {
        WardenError::CircularDependency { .. } => json_error(StatusCode::CONFLICT, "circular_dependency", message),
        WardenError::MaxDepthExceeded { .. } => json_error(StatusCode::CONFLICT, "max_depth_exceeded", message),
        WardenError::CapacityExceeded(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "capacity_exceeded", message)
        }
        WardenError::WorkerPoolSaturated => {
            let mut res = json_error(StatusCode::SERVICE_UNAVAILABLE, "worker_pool_saturated", message);
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            res
        }
        WardenError::CacheUnavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable", message)
        }
        WardenError::InvalidationDeliveryFailed { .. } => {
            json_error(StatusCode::BAD_GATEWAY, "invalidation_failed", message)
        }
        WardenError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        WardenError::Unauthorized(_) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", message),
        WardenError::Store(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parses an identifier newtype, mapping failures to a 400.
pub fn parse_id<T>(raw: &str) -> Result<T, Response>
where
    T: FromStr<Err = WardenError>,
{
    raw.parse().map_err(warden_error_to_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_maps_to_retryable_503() {
        let res = warden_error_to_response(WardenError::WorkerPoolSaturated);
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn hierarchy_and_capacity_errors_are_distinguishable() {
        let cycle = WardenError::CircularDependency {
            child: "a".into(),
            parent: "b".into(),
            domain: "t".into(),
        };
        assert_eq!(warden_error_to_response(cycle).status(), StatusCode::CONFLICT);
        assert_eq!(
            warden_error_to_response(WardenError::MaxDepthExceeded { level: 11, max: 10 }).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            warden_error_to_response(WardenError::capacity("role full")).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert!(parse_id::<warden_core::RoleId>("EDITOR").is_ok());
        let res = parse_id::<warden_core::RoleId>("a:b").unwrap_err();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
