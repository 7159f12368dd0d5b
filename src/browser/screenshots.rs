use crate::browser::Page;
use chrono::Utc;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

/// Writes failure screenshots to disk. Capture is best effort: a failed
/// capture never masks the error being reported.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    dir: PathBuf,
}

impl ScreenshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn capture(&self, page: &dyn Page, code: &str) -> Option<String> {
        let bytes = match page.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target = "dropship.browser", code, error = %err, "screenshot_failed");
                return None;
            }
        };
        let name = format!(
            "{}-{}-{}.png",
            code.to_lowercase(),
            Utc::now().format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self.dir.join(name);
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(target = "dropship.browser", error = %err, "screenshot_dir_failed");
            return None;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                let path = path.display().to_string();
                info!(target = "dropship.browser", code, path = %path, "screenshot_saved");
                Some(path)
            }
            Err(err) => {
                warn!(target = "dropship.browser", error = %err, "screenshot_write_failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{ScriptedBrowser, Site};
    use crate::browser::Browser;

    #[tokio::test]
    async fn capture_writes_png_named_by_code() {
        let dir = std::env::temp_dir().join(format!("shots-{}", Uuid::new_v4()));
        let store = ScreenshotStore::new(&dir);
        let browser = ScriptedBrowser::new(Site::default());
        let page = browser.new_context().await.unwrap();
        let path = store.capture(page.as_ref(), "ORDER_ID_NOT_FOUND").await.unwrap();
        assert!(path.contains("order_id_not_found-"));
        assert!(path.ends_with(".png"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"\x89PNG");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
