use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    rate_limit::Limiters,
};
use axum::{
    body::Bytes,
    extract::ContentLengthLimit,
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use mime::Mime;
use nanoid::nanoid;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

// 5 MB
pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;
pub const PUBLIC_PREFIX: &str = "/assets/uploads";

/// Directory uploaded files are written to. It must be served under
/// [`PUBLIC_PREFIX`].
#[derive(Debug, Clone)]
pub struct UploadDir(pub PathBuf);

#[derive(Serialize)]
struct UploadResponse {
    url: String,
}

/// Sniffs the bytes and returns the file extension when they are an image.
pub fn image_extension(bytes: &[u8]) -> Option<&'static str> {
    let kind = infer::get(bytes)?;
    let media_type = kind.mime_type().parse::<Mime>().ok()?;
    (media_type.type_() == mime::IMAGE).then(|| kind.extension())
}

async fn upload_image(
    Extension(UploadDir(dir)): Extension<UploadDir>,
    Extension(limiters): Extension<Arc<Limiters>>,
    user: AuthUser,
    ContentLengthLimit(bytes): ContentLengthLimit<Bytes, MAX_IMAGE_BYTES>,
) -> AppResult<Json<UploadResponse>> {
    limiters.upload.enforce(&format!("upload:{}", user.id))?;

    if bytes.is_empty() {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "no file was uploaded"));
    }
    let extension = image_extension(&bytes).ok_or_else(|| {
        AppError::from(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "only image uploads are allowed",
        )
    })?;

    let file_name = format!("{}.{extension}", nanoid!());
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(&file_name), &bytes).await?;
    tracing::info!(user_id = %user.id, file = %file_name, size = bytes.len(), "stored upload");

    Ok(Json(UploadResponse {
        url: format!("{PUBLIC_PREFIX}/{file_name}"),
    }))
}

pub fn app() -> Router {
    Router::new().route("/image", post(upload_image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_images_are_accepted() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(image_extension(&png), Some("png"));

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(image_extension(&jpeg), Some("jpg"));

        let pdf = b"%PDF-1.7\n";
        assert_eq!(image_extension(pdf), None);
        assert_eq!(image_extension(b"just some text"), None);
    }
}
