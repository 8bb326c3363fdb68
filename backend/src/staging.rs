use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::AppError,
    settings::SettingsSnapshot,
    storage::{inline_content_disposition, sanitize_key_segment, ObjectStorage, TEMP_PREFIX},
};

const GENERIC_MIME: &str = "application/octet-stream";

/// A file sitting in the temp tier, not yet linked to any document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedFile {
    pub temp_key: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub original_name: String,
    pub declared_mime: Option<String>,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("file must not be empty")]
    Empty,
    #[error("unsupported media type '{0}'")]
    UnsupportedMediaType(String),
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: i64, max: i64 },
    #[error("failed to stage file: {0}")]
    Storage(anyhow::Error),
}

impl From<StagingError> for AppError {
    fn from(value: StagingError) -> Self {
        let status = match &value {
            StagingError::Empty => StatusCode::BAD_REQUEST,
            StagingError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            StagingError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StagingError::Storage(_) => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, value.to_string())
    }
}

/// Uses the declared type unless it is missing or generic, then guesses from the name.
pub fn resolve_mime(declared: Option<&str>, original_name: &str) -> String {
    let declared = declared
        .map(|mime| mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty() && mime != GENERIC_MIME);

    declared.unwrap_or_else(|| {
        mime_guess::from_path(original_name)
            .first_raw()
            .unwrap_or(GENERIC_MIME)
            .to_string()
    })
}

pub fn validate_upload(
    settings: &SettingsSnapshot,
    mime_type: &str,
    size: i64,
) -> Result<(), StagingError> {
    if size <= 0 {
        return Err(StagingError::Empty);
    }
    if size > settings.max_file_size {
        return Err(StagingError::PayloadTooLarge {
            size,
            max: settings.max_file_size,
        });
    }
    if !settings.allows_mime(mime_type) {
        return Err(StagingError::UnsupportedMediaType(mime_type.to_string()));
    }
    Ok(())
}

pub fn temp_key_for(original_name: &str) -> String {
    format!(
        "{TEMP_PREFIX}{}/{}",
        Uuid::new_v4(),
        sanitize_key_segment(original_name)
    )
}

/// Validates and writes one upload to the temp tier. Nothing is written when
/// validation fails.
pub async fn stage_file(
    storage: &dyn ObjectStorage,
    settings: &SettingsSnapshot,
    upload: Upload,
) -> Result<StagedFile, StagingError> {
    let Upload {
        bytes,
        original_name,
        declared_mime,
    } = upload;

    let mime_type = resolve_mime(declared_mime.as_deref(), &original_name);
    let size = bytes.len() as i64;
    validate_upload(settings, &mime_type, size)?;

    let temp_key = temp_key_for(&original_name);
    storage
        .put_object(
            &temp_key,
            bytes,
            Some(mime_type.clone()),
            inline_content_disposition(&original_name),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %temp_key, "failed to write staged file");
            StagingError::Storage(err)
        })?;

    info!(key = %temp_key, %mime_type, size, "file staged");

    Ok(StagedFile {
        temp_key,
        original_name,
        mime_type,
        size,
        client_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{is_temp_key, MemoryStorage};

    fn settings() -> SettingsSnapshot {
        SettingsSnapshot {
            max_file_size: 16,
            allowed_mime_types: vec!["application/pdf".into(), "text/plain".into()],
        }
    }

    #[test]
    fn generic_declared_type_falls_back_to_name() {
        assert_eq!(
            resolve_mime(Some("application/octet-stream"), "scan.pdf"),
            "application/pdf"
        );
        assert_eq!(resolve_mime(Some("Text/Plain; charset=utf-8"), "x.bin"), "text/plain");
        assert_eq!(resolve_mime(None, "noextension"), GENERIC_MIME);
    }

    #[tokio::test]
    async fn stages_valid_upload_under_temp_prefix() {
        let storage = MemoryStorage::new();
        let staged = stage_file(
            &storage,
            &settings(),
            Upload {
                bytes: b"hello".to_vec(),
                original_name: "notes.txt".into(),
                declared_mime: Some("text/plain".into()),
            },
        )
        .await
        .unwrap();

        assert!(is_temp_key(&staged.temp_key));
        assert!(staged.temp_key.ends_with("/notes.txt"));
        assert_eq!(staged.size, 5);
        assert_eq!(storage.get(&staged.temp_key).await.unwrap().bytes, b"hello");
    }

    #[tokio::test]
    async fn rejects_oversized_upload_without_writing() {
        let storage = MemoryStorage::new();
        let result = stage_file(
            &storage,
            &settings(),
            Upload {
                bytes: vec![0; 17],
                original_name: "big.pdf".into(),
                declared_mime: Some("application/pdf".into()),
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(StagingError::PayloadTooLarge { size: 17, max: 16 })
        ));
        assert_eq!(storage.object_count().await, 0);
    }

    #[tokio::test]
    async fn rejects_disallowed_media_type() {
        let storage = MemoryStorage::new();
        let result = stage_file(
            &storage,
            &settings(),
            Upload {
                bytes: b"PK".to_vec(),
                original_name: "archive.zip".into(),
                declared_mime: None,
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, StagingError::UnsupportedMediaType(_)));
        assert_eq!(AppError::from(err).status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(storage.object_count().await, 0);
    }
}
