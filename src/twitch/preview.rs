//! Live preview image fetching.
//!
//! The preview CDN serves a JPEG for live channels and redirects to a 404
//! placeholder otherwise, so redirects are never followed and any non-2xx
//! response counts as "not available yet" — a normal outcome, not an error.

use tracing::debug;

const STATIC_BASE_URL: &str = "https://static-cdn.jtvnw.net";
const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A fetched preview image plus the exact URL it was served from.
#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub url: String,
    pub data: Vec<u8>,
}

/// Cache-busted preview URL for a channel.
///
/// The epoch-millis cache buster is padded to 20 digits and used for both
/// dimensions; the CDN treats any oversized dimension as "original size"
/// while still keying its cache on the full URL.
pub fn preview_image_url(login: &str) -> String {
    let cache_buster = format!("{:0<20}", chrono::Utc::now().timestamp_millis());
    format!("{STATIC_BASE_URL}/previews-ttv/live_user_{login}-{cache_buster}x{cache_buster}.jpg")
}

/// Placeholder URL served for offline channels.
pub fn offline_preview_url(width: u32, height: u32) -> String {
    format!("{STATIC_BASE_URL}/ttv-static/404_preview-{width}x{height}.jpg")
}

/// HTTP client for preview fetches; redirects disabled so a 404-placeholder
/// redirect reads as "not available".
pub struct PreviewClient {
    client: reqwest::Client,
}

impl PreviewClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(DESKTOP_USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Fetch the current preview image, `None` when not available yet.
    pub async fn fetch(&self, login: &str) -> Option<PreviewImage> {
        let url = preview_image_url(login);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("preview fetch failed for {login}: {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        match response.bytes().await {
            Ok(bytes) => Some(PreviewImage {
                url,
                data: bytes.to_vec(),
            }),
            Err(err) => {
                debug!("preview body read failed for {login}: {err}");
                None
            }
        }
    }
}

impl Default for PreviewClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_url_pads_cache_buster_to_twenty_digits() {
        let url = preview_image_url("somestreamer");
        let dims = url
            .rsplit_once("live_user_somestreamer-")
            .map(|(_, tail)| tail.trim_end_matches(".jpg"))
            .unwrap();
        let (w, h) = dims.split_once('x').unwrap();
        assert_eq!(w.len(), 20);
        assert_eq!(w, h);
    }

    #[test]
    fn offline_url_carries_dimensions() {
        assert_eq!(
            offline_preview_url(1920, 1080),
            "https://static-cdn.jtvnw.net/ttv-static/404_preview-1920x1080.jpg"
        );
    }
}
