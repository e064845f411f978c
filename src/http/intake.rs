use crate::errors::{AppError, AppResult};
use crate::uploads::{StagedFile, UploadKind, UploadManager};
use crate::validation::FormFields;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use serde_json::Value;

/// Text fields plus at most one staged file.
pub struct Submission {
    pub fields: FormFields,
    pub file: Option<StagedFile>,
}

/// Reads a multipart or JSON body. A file in `file_field` is streamed to
/// disk as a staged upload; any other file part is rejected.
pub async fn read_submission(
    request: Request,
    uploads: &UploadManager,
    kind: UploadKind,
    file_field: &str,
) -> AppResult<Submission> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
        read_multipart(multipart, uploads, kind, file_field).await
    } else {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
        Ok(Submission {
            fields: json_fields(&body)?,
            file: None,
        })
    }
}

async fn read_multipart(
    mut multipart: Multipart,
    uploads: &UploadManager,
    kind: UploadKind,
    file_field: &str,
) -> AppResult<Submission> {
    let mut fields = FormFields::new();
    let mut file: Option<StagedFile> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(ToString::to_string) else {
            continue;
        };

        let Some(original_name) = field.file_name().map(ToString::to_string) else {
            let value = field.text().await.map_err(multipart_error)?;
            fields.insert(name, value);
            continue;
        };
        // Browsers send an empty part when no file was chosen.
        if original_name.is_empty() {
            continue;
        }
        if name != file_field || file.is_some() {
            return Err(AppError::BadRequest(format!("Unexpected file field: {name}")));
        }

        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let mut staged = uploads.stage(kind, &original_name, &mime).await?;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            staged.write_chunk(&chunk).await?;
        }
        staged.finish().await?;
        tracing::debug!(url = %staged.public_url(), bytes = staged.size(), "upload staged");
        file = Some(staged);
    }

    Ok(Submission { fields, file })
}

fn multipart_error(error: MultipartError) -> AppError {
    AppError::BadRequest(error.body_text())
}

/// Flattens a JSON object into text fields; `null` counts as absent.
fn json_fields(body: &[u8]) -> AppResult<FormFields> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(FormFields::new());
    }
    let object: serde_json::Map<String, Value> = serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("Invalid JSON body: {err}")))?;

    let mut fields = FormFields::new();
    for (name, value) in object {
        let text = match value {
            Value::Null => continue,
            Value::String(text) => text,
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(AppError::BadRequest(format!("Field {name} must be a scalar value")));
            }
        };
        fields.insert(name, text);
    }
    Ok(fields)
}
