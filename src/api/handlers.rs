//! Request handlers for the voiceprint endpoints.
//!
//! Multipart form bodies carry the audio; JSON carries everything else.
//! Transport de-obfuscation of `encrypted_audio` payloads happens here,
//! before anything touches the pipeline. Error kinds map onto stable HTTP
//! statuses; the feature toggle short-circuits every route with 503.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::api::server::AppContext;
use crate::audio::xor;
use crate::error::Error;
use crate::verifier::AudioClip;

#[derive(Serialize)]
pub struct EnrollResponse {
    pub status: &'static str,
    pub customer_id: String,
    pub device_id: Option<String>,
    pub message: String,
    pub num_samples: usize,
}

#[derive(Deserialize)]
pub struct DeleteParams {
    pub customer_id: String,
}

#[derive(Serialize)]
pub struct UserListResponse {
    pub users: Vec<crate::verifier::EnrolledUser>,
    pub count: usize,
}

/// Map an error kind onto its HTTP status.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::BadAudio { .. }
        | Error::Unsupported { .. }
        | Error::TooFewSamples { .. }
        | Error::TooManySamples { .. }
        | Error::NotEnrolled { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::CohortUnavailable | Error::StoreUnavailable { .. } | Error::ServiceDisabled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    if matches!(err, Error::Internal { .. }) {
        error!("request failed: {}", err);
    }
    let status = status_for(&err);
    let body = json!({ "error": err.to_string(), "code": err.code() });
    (status, Json(body)).into_response()
}

fn ensure_enabled(ctx: &AppContext) -> Result<(), Response> {
    if ctx.config.voiceprint_enabled {
        Ok(())
    } else {
        Err(error_response(Error::ServiceDisabled))
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> Response {
    error_response(Error::bad_audio(format!("malformed multipart body: {}", err)))
}

/// POST /v1/voiceprint/enroll
pub async fn enroll(State(ctx): State<AppContext>, mut multipart: Multipart) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    let mut customer_id: Option<String> = None;
    let mut device_id: Option<String> = None;
    let mut clips: Vec<AudioClip> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return multipart_error(e),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("customer_id") => match field.text().await {
                Ok(text) => customer_id = Some(text),
                Err(e) => return multipart_error(e),
            },
            Some("device_id") => match field.text().await {
                Ok(text) => device_id = Some(text),
                Err(e) => return multipart_error(e),
            },
            Some("files") | Some("files[]") | Some("file") => {
                let hint = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => clips.push(AudioClip { bytes: bytes.to_vec(), hint }),
                    Err(e) => return multipart_error(e),
                }
            }
            _ => {}
        }
    }

    let Some(customer_id) = customer_id else {
        return error_response(Error::bad_audio("missing customer_id field"));
    };

    match ctx.verifier.enroll(&customer_id, clips).await {
        Ok(outcome) => Json(EnrollResponse {
            status: "success",
            customer_id: outcome.customer_id,
            device_id,
            message: format!(
                "Voiceprint enrolled successfully with {} samples",
                outcome.num_samples
            ),
            num_samples: outcome.num_samples,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /v1/voiceprint/verify
pub async fn verify(State(ctx): State<AppContext>, mut multipart: Multipart) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    let mut customer_id: Option<String> = None;
    let mut clip: Option<AudioClip> = None;
    let mut encrypted_audio: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return multipart_error(e),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("customer_id") => match field.text().await {
                Ok(text) => customer_id = Some(text),
                Err(e) => return multipart_error(e),
            },
            Some("file") => {
                let hint = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => clip = Some(AudioClip { bytes: bytes.to_vec(), hint }),
                    Err(e) => return multipart_error(e),
                }
            }
            Some("encrypted_audio") => match field.text().await {
                Ok(text) => encrypted_audio = Some(text),
                Err(e) => return multipart_error(e),
            },
            _ => {}
        }
    }

    let Some(customer_id) = customer_id else {
        return error_response(Error::bad_audio("missing customer_id field"));
    };

    // Obfuscated payloads take the place of a file upload.
    let clip = match (clip, encrypted_audio) {
        (Some(clip), _) => clip,
        (None, Some(encoded)) => {
            if !ctx.config.audio_xor_enabled {
                return error_response(Error::bad_audio(
                    "encrypted_audio submitted but decryption is disabled",
                ));
            }
            match xor::decode_obfuscated(&encoded, &ctx.config.audio_xor_key) {
                Ok(bytes) => AudioClip { bytes, hint: None },
                Err(err) => return error_response(err),
            }
        }
        (None, None) => return error_response(Error::bad_audio("no audio provided")),
    };

    match ctx.verifier.verify(&customer_id, clip).await {
        Ok(outcome) => Json(outcome).into_response(),
        // Not-enrolled keeps the legacy body shape so callers can branch on
        // `verified` without inspecting the status code.
        Err(err @ Error::NotEnrolled { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "verified": false, "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// DELETE /v1/voiceprint/
pub async fn delete_voiceprint(
    State(ctx): State<AppContext>,
    Query(params): Query<DeleteParams>,
) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    match ctx.verifier.delete(&params.customer_id).await {
        Ok(true) => Json(json!({
            "status": "success",
            "message": format!("Customer {} deleted", params.customer_id),
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "not_found",
                "message": format!("Customer {} not found", params.customer_id),
            })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /v1/voiceprint/verify/{customer_id}/history
pub async fn history(
    State(ctx): State<AppContext>,
    Path(customer_id): Path<String>,
) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    match ctx.verifier.history(&customer_id).await {
        Ok(attempts) => Json(attempts).into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /v1/voiceprint/users
pub async fn list_users(State(ctx): State<AppContext>) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    match ctx.verifier.list_enrolled(100).await {
        Ok(users) => {
            let count = users.len();
            Json(UserListResponse { users, count }).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// GET /v1/voiceprint/health
pub async fn health(State(ctx): State<AppContext>) -> Response {
    if let Err(response) = ensure_enabled(&ctx) {
        return response;
    }

    let report = ctx.verifier.health().await;
    let status = if report.cohort_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_documented_statuses() {
        assert_eq!(status_for(&Error::bad_audio("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::TooFewSamples { got: 2, min: 3 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::TooManySamples { got: 11, max: 10 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::NotEnrolled { customer_id: "a".into() }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::NotFound { customer_id: "a".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::Conflict { message: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::CohortUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::store("down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::ServiceDisabled),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::Timeout { seconds: 10 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&Error::internal("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
