//! Image compression pipeline (§4.5): downloads an attachment and shrinks it
//! through up to six stages until it fits under a target fraction of the
//! provider's payload limit. Internal — not LLM-facing, so it is a plain
//! struct rather than a `rig::tool::Tool`; `ReactiveEngine` runs it on a
//! bounded worker pool (2 concurrent per user, ≤5 globally per turn) rather
//! than inline on the event loop, per §5's suspension-point note.

use image::imageops::FilterType;

/// Anthropic's stated per-image payload ceiling; the pipeline targets
/// `compression_target` of this.
const PROVIDER_IMAGE_LIMIT_BYTES: usize = 5 * 1024 * 1024;
const MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum Stage {
    ResizeLongEdge(u32),
    Quality(u8),
}

const PIPELINE: [Stage; 6] = [
    Stage::ResizeLongEdge(1568),
    Stage::ResizeLongEdge(1024),
    Stage::Quality(85),
    Stage::Quality(75),
    Stage::ResizeLongEdge(768),
    Stage::Quality(60),
];

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("host {0} is not in the allowed CDN list")]
    DisallowedHost(String),
    #[error("download exceeded the {} MB cap", MAX_DOWNLOAD_BYTES / 1024 / 1024)]
    TooLarge,
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("could not compress under the target size after exhausting all stages")]
    Incompressible,
}

#[derive(Clone)]
pub struct ImagePipeline {
    client: reqwest::Client,
    allowed_hosts: Vec<String>,
    target_bytes: usize,
}

impl ImagePipeline {
    pub fn new(client: reqwest::Client, allowed_hosts: Vec<String>, compression_target: f64) -> Self {
        Self {
            client,
            allowed_hosts,
            target_bytes: (PROVIDER_IMAGE_LIMIT_BYTES as f64 * compression_target) as usize,
        }
    }

    fn host_allowed(&self, url: &str) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return false;
        };
        matches!(parsed.host_str(), Some(host) if self.allowed_hosts.iter().any(|h| host == h || host.ends_with(&format!(".{h}"))))
    }

    /// Downloads `url` and returns base64-encoded JPEG bytes under the
    /// configured target, or an error if no stage in the ladder gets there.
    pub async fn process(&self, url: &str) -> Result<ProcessedImage, ImageError> {
        if !self.host_allowed(url) {
            return Err(ImageError::DisallowedHost(url.to_string()));
        }

        let response = self.client.get(url).send().await?;
        if let Some(len) = response.content_length() {
            if len > MAX_DOWNLOAD_BYTES {
                return Err(ImageError::TooLarge);
            }
        }
        let bytes = response.bytes().await?;
        if bytes.len() as u64 > MAX_DOWNLOAD_BYTES {
            return Err(ImageError::TooLarge);
        }

        let original = image::load_from_memory(&bytes)?;
        if bytes.len() <= self.target_bytes {
            return Ok(ProcessedImage {
                bytes: bytes.to_vec(),
                media_type: guess_media_type(&bytes),
                stages_applied: 0,
            });
        }

        let mut current = original;
        let mut quality: u8 = 90;

        for (index, stage) in PIPELINE.iter().enumerate() {
            match *stage {
                Stage::ResizeLongEdge(edge) => {
                    current = resize_long_edge(&current, edge);
                }
                Stage::Quality(q) => {
                    quality = q;
                }
            }

            let encoded = encode_jpeg(&current, quality)?;
            if encoded.len() <= self.target_bytes {
                return Ok(ProcessedImage {
                    bytes: encoded,
                    media_type: "image/jpeg".to_string(),
                    stages_applied: index + 1,
                });
            }
        }

        Err(ImageError::Incompressible)
    }
}

/// Sniffs the real format from the magic bytes so an already-small-enough
/// image (returned verbatim, skipping the jpeg re-encode stages) is labelled
/// correctly rather than always claimed as jpeg.
fn guess_media_type(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png".to_string(),
        Ok(image::ImageFormat::WebP) => "image/webp".to_string(),
        _ => "image/jpeg".to_string(),
    }
}

fn resize_long_edge(image: &image::DynamicImage, long_edge: u32) -> image::DynamicImage {
    let (w, h) = (image.width(), image.height());
    if w.max(h) <= long_edge {
        return image.clone();
    }
    if w >= h {
        image.resize(long_edge, h * long_edge / w, FilterType::Lanczos3)
    } else {
        image.resize(w * long_edge / h, long_edge, FilterType::Lanczos3)
    }
}

fn encode_jpeg(image: &image::DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buf);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
    image.write_with_encoder(encoder)?;
    Ok(buf)
}

pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub stages_applied: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_disallowed_host() {
        let pipeline = ImagePipeline::new(reqwest::Client::new(), vec!["cdn.discordapp.com".into()], 0.73);
        assert!(!pipeline.host_allowed("https://evil.example.com/x.png"));
        assert!(pipeline.host_allowed("https://cdn.discordapp.com/attachments/1/2/x.png"));
        assert!(pipeline.host_allowed("https://media.cdn.discordapp.com/x.png"));
    }

    #[test]
    fn empty_allowlist_permits_everything() {
        let pipeline = ImagePipeline::new(reqwest::Client::new(), vec![], 0.73);
        assert!(pipeline.host_allowed("https://anything.example.com/x.png"));
    }

    #[test]
    fn resize_long_edge_preserves_aspect_ratio() {
        let image = image::DynamicImage::new_rgb8(2000, 1000);
        let resized = resize_long_edge(&image, 1000);
        assert_eq!(resized.width(), 1000);
        assert_eq!(resized.height(), 500);
    }

    #[test]
    fn resize_long_edge_is_noop_when_already_small() {
        let image = image::DynamicImage::new_rgb8(400, 300);
        let resized = resize_long_edge(&image, 1568);
        assert_eq!((resized.width(), resized.height()), (400, 300));
    }

    #[test]
    fn guess_media_type_detects_png_and_falls_back_to_jpeg() {
        let image = image::DynamicImage::new_rgb8(4, 4);
        let mut png_bytes = Vec::new();
        image
            .write_with_encoder(image::codecs::png::PngEncoder::new(&mut png_bytes))
            .unwrap();
        assert_eq!(guess_media_type(&png_bytes), "image/png");
        assert_eq!(guess_media_type(b"not an image"), "image/jpeg");
    }
}
