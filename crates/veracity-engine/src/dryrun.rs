use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgba};
use sha2::{Digest, Sha256};
use veracity_contracts::records::{
    AnalysisResult, ChatMessage, Classification, HighlightImage, ImageFile,
};

use crate::config::{ResolvedModels, ServiceConfig};
use crate::service::{AnalysisService, ChatSession};

/// Offline stand-in for the remote model. Verdicts are a pure function of
/// the image bytes so repeated runs agree.
pub struct DryrunService {
    models: ResolvedModels,
}

impl DryrunService {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            models: config.resolve_models("dryrun")?,
        })
    }
}

impl AnalysisService for DryrunService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, image: &ImageFile) -> Result<AnalysisResult> {
        let digest = Sha256::digest(image.bytes());
        let classification =
            Classification::ALL[usize::from(digest[0]) % Classification::ALL.len()];
        let reasoning = match classification {
            Classification::Real => "Sensor noise and lighting falloff are consistent across the frame.",
            Classification::AiGenerated => {
                "Texture repeats and edge halos suggest a synthetic origin."
            }
            Classification::Uncertain => "The evidence is mixed; no decisive artifacts were found.",
        };
        Ok(AnalysisResult::new(
            classification,
            format!(
                "{reasoning} ({} bytes, digest {}, model {})",
                image.len(),
                hex::encode(&digest[..4]),
                self.models.analysis
            ),
        ))
    }

    fn highlight(&self, image: &ImageFile, _reasoning: &str) -> Result<HighlightImage> {
        let mut canvas = image::load_from_memory(image.bytes())
            .with_context(|| format!("dryrun highlight could not decode {}", image.name))?
            .to_rgba8();
        let (width, height) = canvas.dimensions();
        let thickness = (width.min(height) / 25).max(1);
        let marker = Rgba([255, 0, 0, 255]);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            let on_edge = x < thickness
                || y < thickness
                || x >= width.saturating_sub(thickness)
                || y >= height.saturating_sub(thickness);
            if on_edge {
                *pixel = marker;
            }
        }
        let mut out = Cursor::new(Vec::new());
        canvas
            .write_to(&mut out, ImageFormat::Png)
            .context("dryrun highlight encode failed")?;
        Ok(HighlightImage::new("image/png", out.into_inner()))
    }

    fn create_chat(&self, priming: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>> {
        let context = priming
            .iter()
            .rev()
            .find(|turn| turn.content.starts_with("Analysis Classification:"))
            .map(|turn| turn.content.clone())
            .unwrap_or_default();
        Ok(Box::new(DryrunChatSession {
            context,
            exchanges: 0,
        }))
    }
}

struct DryrunChatSession {
    context: String,
    exchanges: usize,
}

impl ChatSession for DryrunChatSession {
    fn send(&mut self, text: &str) -> Result<String> {
        self.exchanges += 1;
        Ok(format!(
            "[dryrun #{}] You asked: \"{}\". {}",
            self.exchanges,
            text.trim(),
            if self.context.is_empty() {
                "No analysis context is available."
            } else {
                self.context.as_str()
            }
        ))
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, RgbaImage};

    use super::*;
    use crate::conversation::priming_turns;

    fn dryrun() -> DryrunService {
        DryrunService::new(&ServiceConfig::default()).unwrap()
    }

    fn png(width: u32, height: u32) -> ImageFile {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([0, 0, 255, 255])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        ImageFile::new("blue.png", "image/png", out.into_inner())
    }

    #[test]
    fn analysis_is_deterministic_per_bytes() -> anyhow::Result<()> {
        let service = dryrun();
        let image = ImageFile::new("a.png", "image/png", vec![1, 2, 3]);
        let first = service.analyze(&image)?;
        let second = service.analyze(&image.clone())?;
        assert_eq!(first, second);
        assert!(first.reasoning.contains("3 bytes"));
        assert!(first.reasoning.contains("dryrun-vision-1"));
        Ok(())
    }

    #[test]
    fn highlight_frames_the_image_in_red() -> anyhow::Result<()> {
        let output = dryrun().highlight(&png(50, 50), "edges")?;
        assert_eq!(output.mime_type, "image/png");
        let decoded = image::load_from_memory(output.bytes())?.to_rgba8();
        assert_eq!(decoded.dimensions(), (50, 50));
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(decoded.get_pixel(25, 25), &Rgba([0, 0, 255, 255]));
        Ok(())
    }

    #[test]
    fn highlight_fails_for_undecodable_bytes() {
        let image = ImageFile::new("junk.png", "image/png", vec![0, 1, 2]);
        let err = dryrun().highlight(&image, "x").err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("dryrun highlight could not decode junk.png")
        );
    }

    #[test]
    fn chat_replies_from_seeded_context() -> anyhow::Result<()> {
        let result = AnalysisResult::new(Classification::Real, "clear skin texture");
        let mut session = dryrun().create_chat(priming_turns(&result))?;
        let reply = session.send("is this certain?")?;
        assert!(reply.starts_with("[dryrun #1]"));
        assert!(reply.contains("Analysis Classification: REAL. Reasoning: clear skin texture"));
        assert!(session.send("again")?.starts_with("[dryrun #2]"));
        Ok(())
    }
}
