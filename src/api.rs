//! One-shot detector API: file upload detection and report export.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use image::{RgbImage, RgbaImage};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detection::{Detection, DetectionResult};
use crate::render::AnnotationRenderer;

/// Summary returned by the detect endpoints.
///
/// Image mode fills `ships`; video mode fills the frame aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    #[serde(default)]
    pub total_ships: u32,
    #[serde(default)]
    pub has_ships: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ships: Option<Vec<Detection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_frames_processed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_with_ships: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ships_per_frame: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_ships_per_frame: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ships_detected: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub results: DetectionSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Report format for `/export/{format}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Pdf,
    Excel,
}

impl ExportFormat {
    /// Path segment of the export endpoint
    pub fn endpoint(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Excel => "excel",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Excel => "xlsx",
        }
    }

    /// `ship_detection_<timestamp>.<ext>`
    pub fn file_name(&self, at: chrono::DateTime<chrono::Local>) -> String {
        format!("ship_detection_{}.{}", at.format("%Y%m%d_%H%M%S"), self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(ExportFormat::Pdf),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            other => bail!("unknown export format: {}", other),
        }
    }
}

#[derive(Serialize)]
struct ExportRequest<'a> {
    results: &'a DetectionSummary,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// HTTP client for the detector's request/response endpoints.
#[derive(Debug, Clone)]
pub struct DetectClient {
    base: String,
    http: Client,
}

impl DetectClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Upload an image to `/detect/image`.
    pub async fn detect_image(&self, path: &Path) -> Result<DetectResponse> {
        self.detect("/detect/image", path).await
    }

    /// Upload a video to `/detect/video`.
    pub async fn detect_video(&self, path: &Path) -> Result<DetectResponse> {
        self.detect("/detect/video", path).await
    }

    async fn detect(&self, endpoint: &str, path: &Path) -> Result<DetectResponse> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        info!("Uploading {} ({} bytes) to {}", file_name, data.len(), endpoint);
        let form = Form::new().part("file", Part::bytes(data).file_name(file_name));

        let response = self
            .http
            .post(format!("{}{}", self.base, endpoint))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", endpoint))?;

        let status = response.status();
        let body = response.bytes().await.context("Failed to read response body")?;
        if !status.is_success() {
            bail!("{}", api_error(status, &body));
        }

        let parsed: DetectResponse =
            serde_json::from_slice(&body).context("Unexpected detect response")?;
        debug!(
            "Detect finished in {:.3}s: {} ships",
            parsed.processing_time, parsed.results.total_ships
        );
        Ok(parsed)
    }

    /// Render `results` as a report on the server and return the file bytes.
    pub async fn export(&self, format: ExportFormat, results: &DetectionSummary) -> Result<Bytes> {
        let response = self
            .http
            .post(format!("{}/export/{}", self.base, format.endpoint()))
            .json(&ExportRequest { results })
            .send()
            .await
            .context("Export request failed")?;

        let status = response.status();
        let body = response.bytes().await.context("Failed to read export body")?;
        if !status.is_success() {
            bail!("Export failed: {}", api_error(status, &body));
        }
        Ok(body)
    }
}

/// Error text for a non-2xx response, preferring the server's `detail`.
fn api_error(status: reqwest::StatusCode, body: &[u8]) -> String {
    let detail = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail)
        .map(|d| match d {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

    match detail {
        Some(detail) => detail,
        None => format!("API error ({})", status),
    }
}

/// Annotate a still image with image-mode results.
pub fn render_still(
    renderer: &AnnotationRenderer,
    image: &RgbImage,
    summary: &DetectionSummary,
) -> RgbaImage {
    let result = DetectionResult {
        ships: summary.ships.clone().unwrap_or_default(),
        total_ships: summary.total_ships,
    };
    renderer.render(image, &result)
}

/// Load a saved `DetectResponse` or bare `DetectionSummary` from JSON.
pub fn summary_from_json(data: &[u8]) -> Result<DetectionSummary> {
    if let Ok(response) = serde_json::from_slice::<DetectResponse>(data) {
        return Ok(response.results);
    }
    serde_json::from_slice(data).map_err(|e| anyhow!("Not a detection result: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::BOX_COLOR;

    #[test]
    fn test_image_response_parses() {
        let json = br#"{
            "success": true,
            "processing_time": 0.123,
            "results": {
                "total_ships": 1,
                "has_ships": true,
                "ships": [{"class": "ship", "conf": 0.81, "bbox": [1, 2, 30, 40]}],
                "avg_confidence": 0.81
            }
        }"#;
        let response: DetectResponse = serde_json::from_slice(json).unwrap();
        assert!(response.success);
        assert_eq!(response.results.total_ships, 1);
        assert_eq!(response.results.ships.as_ref().unwrap()[0].label(), "ship 81%");
        assert!(response.results.total_frames_processed.is_none());
    }

    #[test]
    fn test_video_response_parses() {
        let json = br#"{
            "success": true,
            "processing_time": 12.5,
            "results": {
                "total_ships": 3,
                "has_ships": true,
                "total_frames_processed": 120,
                "frames_with_ships": 40,
                "max_ships_per_frame": 3,
                "avg_ships_per_frame": 0.4,
                "total_ships_detected": 48
            }
        }"#;
        let summary = summary_from_json(json).unwrap();
        assert!(summary.ships.is_none());
        assert_eq!(summary.frames_with_ships, Some(40));
        assert_eq!(summary.total_ships_detected, Some(48));
    }

    #[test]
    fn test_failed_response_keeps_error() {
        let response: DetectResponse =
            serde_json::from_slice(br#"{"success": false, "error": "bad image"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("bad image"));
        assert_eq!(response.results, DetectionSummary::default());
    }

    #[test]
    fn test_api_error_prefers_detail() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(api_error(status, br#"{"detail": "Images only"}"#), "Images only");
        assert_eq!(api_error(status, b"not json"), "API error (400 Bad Request)");
    }

    #[test]
    fn test_export_format() {
        assert_eq!("excel".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
        assert_eq!("PDF".parse::<ExportFormat>().unwrap(), ExportFormat::Pdf);
        assert!("csv".parse::<ExportFormat>().is_err());

        let at = chrono::Local::now();
        let name = ExportFormat::Excel.file_name(at);
        assert!(name.starts_with("ship_detection_"));
        assert!(name.ends_with(".xlsx"));
    }

    #[test]
    fn test_export_body_wraps_results() {
        let summary = DetectionSummary {
            total_ships: 2,
            has_ships: true,
            ..DetectionSummary::default()
        };
        let body = serde_json::to_value(ExportRequest { results: &summary }).unwrap();
        assert_eq!(body["results"]["total_ships"], 2);
        assert!(body["results"].get("ships").is_none());
    }

    #[test]
    fn test_render_still_draws_boxes() {
        let summary = DetectionSummary {
            total_ships: 1,
            has_ships: true,
            ships: Some(vec![Detection::new("ship", 0.9, [10.0, 40.0, 60.0, 80.0])]),
            ..DetectionSummary::default()
        };
        let out = render_still(&AnnotationRenderer::default(), &RgbImage::new(100, 100), &summary);
        assert_eq!(*out.get_pixel(35, 80), BOX_COLOR);
    }

    #[test]
    fn test_client_trims_base() {
        let client = DetectClient::new("http://localhost:8001/").unwrap();
        assert_eq!(client.base(), "http://localhost:8001");
    }
}
