//! Downloads for remote URL assets.

use crate::asset::AssetType;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(reqwest::StatusCode),

    #[error("could not write download: {0}")]
    Io(#[from] std::io::Error),
}

/// A downloaded remote asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub path: PathBuf,
    /// Type judged from the URL, or the response's content type
    pub asset_type: AssetType,
    pub bytes: u64,
}

/// File name for a URL's last path segment, if it has one.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let without_scheme = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let (_, tail) = without_scheme.split_once('/')?;
    let name = tail.rsplit('/').next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Extension for the media types we can optimise.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    Some(match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/heic" | "image/heif" => "heic",
        "image/tiff" => "tiff",
        "image/bmp" => "bmp",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "application/pdf" => "pdf",
        _ => return None,
    })
}

/// Download `url` into `dir`, streaming to disk.
pub async fn download(client: &reqwest::Client, url: &str, dir: &Path) -> Result<Downloaded, FetchError> {
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }

    let mut name = file_name_from_url(url).unwrap_or_else(|| "download".to_string());
    if AssetType::from_path(Path::new(&name)) == AssetType::Unknown {
        let ext = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(extension_for_content_type);
        if let Some(ext) = ext {
            name = format!("{}.{}", name, ext);
        }
    }

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&name);
    let mut file = tokio::fs::File::create(&path).await?;
    let mut bytes = 0u64;
    while let Some(chunk) = response.chunk().await? {
        bytes += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    debug!(url, path = %path.display(), bytes, "downloaded remote asset");
    Ok(Downloaded {
        asset_type: AssetType::from_path(&path),
        path,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::ImageFormat;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/img/photo.png?w=200#x"),
            Some("photo.png".to_string())
        );
        assert_eq!(file_name_from_url("https://example.com/"), None);
        assert_eq!(file_name_from_url("https://example.com"), None);
        assert_eq!(
            file_name_from_url("http://example.com/raw"),
            Some("raw".to_string())
        );
    }

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(extension_for_content_type("image/png"), Some("png"));
        assert_eq!(
            extension_for_content_type("image/jpeg; charset=binary"),
            Some("jpg")
        );
        assert_eq!(extension_for_content_type("Video/QuickTime"), Some("mov"));
        assert_eq!(extension_for_content_type("text/html"), None);
        assert_eq!(
            AssetType::from_path(Path::new("raw.png")),
            AssetType::Image(ImageFormat::Png)
        );
    }
}
