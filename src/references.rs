use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::ReferenceImage;

// registered images win over files in the directory
#[derive(Default)]
pub struct ReferenceStore {
    dir: Option<PathBuf>,
    pinned: DashMap<String, ReferenceImage>,
}

impl ReferenceStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            pinned: DashMap::new(),
        }
    }

    pub fn insert(&self, image: ReferenceImage) {
        self.pinned.insert(image.name.to_ascii_lowercase(), image);
    }

    pub async fn resolve(&self, name: &str) -> Option<ReferenceImage> {
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        if let Some(image) = self.pinned.get(&name.to_ascii_lowercase()) {
            return Some(image.clone());
        }

        let dir = self.dir.as_ref()?;
        let path = find_image(dir, name).await?;
        let mime_type = mime_for_path(&path)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Some(ReferenceImage {
                name: name.to_string(),
                data,
                mime_type: mime_type.to_string(),
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "reference image unreadable");
                None
            }
        }
    }
}

async fn find_image(dir: &Path, name: &str) -> Option<PathBuf> {
    let wanted = name.to_ascii_lowercase();
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if mime_for_path(&path).is_none() {
            continue;
        }
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase());
        let stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase());
        if file_name.as_deref() == Some(wanted.as_str()) || stem.as_deref() == Some(wanted.as_str())
        {
            return Some(path);
        }
    }
    None
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
