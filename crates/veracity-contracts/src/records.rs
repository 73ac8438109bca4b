use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "REAL")]
    Real,
    #[serde(rename = "AI_GENERATED")]
    AiGenerated,
    #[serde(rename = "UNCERTAIN")]
    Uncertain,
}

impl Classification {
    pub const ALL: [Classification; 3] = [
        Classification::Real,
        Classification::AiGenerated,
        Classification::Uncertain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Real => "REAL",
            Classification::AiGenerated => "AI_GENERATED",
            Classification::Uncertain => "UNCERTAIN",
        }
    }

    /// Short human label, as shown next to a verdict.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Real => "Likely Real",
            Classification::AiGenerated => "Likely AI-Generated",
            Classification::Uncertain => "Uncertain",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "REAL" => Ok(Classification::Real),
            "AI_GENERATED" | "AI" | "FAKE" => Ok(Classification::AiGenerated),
            "UNCERTAIN" => Ok(Classification::Uncertain),
            _ => bail!("unrecognized classification '{}'", raw.trim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub classification: Classification,
    pub reasoning: String,
}

impl AnalysisResult {
    pub fn new(classification: Classification, reasoning: impl Into<String>) -> Self {
        Self {
            classification,
            reasoning: reasoning.into(),
        }
    }
}

/// Raw bytes of one uploaded image. Cloning shares the bytes; they are never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    bytes: Arc<[u8]>,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        if bytes.is_empty() {
            bail!("{} is empty", path.display());
        }
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("image")
            .to_string();
        Ok(Self::new(name, guess_image_mime(path), bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn same_bytes(&self, other: &ImageFile) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

pub fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

#[derive(Debug)]
pub struct Preview {
    pub id: u64,
    file: ImageFile,
}

impl Preview {
    pub fn data_url(&self) -> String {
        data_url(&self.file.mime_type, self.file.bytes())
    }
}

/// Renderable handle shared by a record and any History entry made from it.
#[derive(Debug, Clone)]
pub struct PreviewHandle(Arc<Preview>);

impl PreviewHandle {
    pub fn new(id: u64, file: &ImageFile) -> Self {
        Self(Arc::new(Preview {
            id,
            file: file.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn data_url(&self) -> String {
        self.0.data_url()
    }
}

impl PartialEq for PreviewHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PreviewHandle {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightImage {
    pub mime_type: String,
    bytes: Arc<[u8]>,
}

impl HighlightImage {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_url(&self) -> String {
        data_url(&self.mime_type, &self.bytes)
    }
}

fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Loading,
    Highlighting,
    Success,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Loading => "loading",
            RecordStatus::Highlighting => "highlighting",
            RecordStatus::Success => "success",
            RecordStatus::Error => "error",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            content: content.into(),
        }
    }

    /// Opening transcript message for a record whose analysis just succeeded.
    pub fn analysis_summary(result: &AnalysisResult) -> Self {
        Self::model(format!(
            "**Analysis Complete:** The image is classified as **{}**.\n\n**Reasoning:**\n{}",
            result.classification, result.reasoning
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub file: ImageFile,
    pub preview: PreviewHandle,
    pub status: RecordStatus,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub highlight: Option<HighlightImage>,
    pub chat_messages: Vec<ChatMessage>,
}

impl ImageRecord {
    pub fn pending(id: impl Into<String>, file: ImageFile, preview: PreviewHandle) -> Self {
        Self {
            id: id.into(),
            file,
            preview,
            status: RecordStatus::Pending,
            result: None,
            error: None,
            highlight: None,
            chat_messages: Vec::new(),
        }
    }

    /// A record rebuilt from History: succeeded, selected fresh, no highlight.
    pub fn from_history(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            file: entry.file.clone(),
            preview: entry.preview.clone(),
            status: RecordStatus::Success,
            result: Some(entry.result.clone()),
            error: None,
            highlight: None,
            chat_messages: vec![ChatMessage::analysis_summary(&entry.result)],
        }
    }

    pub fn succeeded(&self, result: AnalysisResult) -> Self {
        Self {
            status: RecordStatus::Success,
            chat_messages: vec![ChatMessage::analysis_summary(&result)],
            result: Some(result),
            error: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            error: Some(message.into()),
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: RecordStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Back to success with a new overlay; the last successful highlight wins.
    pub fn highlighted(&self, image: HighlightImage) -> Self {
        Self {
            status: RecordStatus::Success,
            highlight: Some(image),
            ..self.clone()
        }
    }

    pub fn with_message(&self, message: ChatMessage) -> Self {
        let mut next = self.clone();
        next.chat_messages.push(message);
        next
    }

    pub fn history_entry(&self) -> Option<HistoryEntry> {
        let result = self.result.clone()?;
        Some(HistoryEntry {
            id: self.id.clone(),
            preview: self.preview.clone(),
            result,
            file: self.file.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub preview: PreviewHandle,
    pub result: AnalysisResult,
    pub file: ImageFile,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> ImageFile {
        ImageFile::new(name, "image/png", vec![1, 2, 3])
    }

    #[test]
    fn classification_serializes_to_wire_names() -> anyhow::Result<()> {
        let raw = serde_json::to_string(&AnalysisResult::new(
            Classification::AiGenerated,
            "smooth hands",
        ))?;
        assert_eq!(
            raw,
            r#"{"classification":"AI_GENERATED","reasoning":"smooth hands"}"#
        );
        let parsed: AnalysisResult =
            serde_json::from_str(r#"{"classification":"REAL","reasoning":"grain"}"#)?;
        assert_eq!(parsed.classification, Classification::Real);
        Ok(())
    }

    #[test]
    fn classification_parses_loose_spellings() {
        assert_eq!(
            "ai-generated".parse::<Classification>().ok(),
            Some(Classification::AiGenerated)
        );
        assert_eq!(
            " uncertain ".parse::<Classification>().ok(),
            Some(Classification::Uncertain)
        );
        assert!("maybe".parse::<Classification>().is_err());
    }

    #[test]
    fn summary_message_carries_classification_and_reasoning() {
        let message = ChatMessage::analysis_summary(&AnalysisResult::new(
            Classification::Real,
            "clear skin texture",
        ));
        assert_eq!(message.role, ChatRole::Model);
        assert_eq!(
            message.content,
            "**Analysis Complete:** The image is classified as **REAL**.\n\n**Reasoning:**\nclear skin texture"
        );
    }

    #[test]
    fn success_reseeds_transcript_and_clears_error() {
        let image = file("a.png");
        let record = ImageRecord::pending("1-a.png", image.clone(), PreviewHandle::new(1, &image))
            .with_message(ChatMessage::user("stale"))
            .failed("boom");
        let done = record.succeeded(AnalysisResult::new(Classification::Uncertain, "blurry"));
        assert_eq!(done.status, RecordStatus::Success);
        assert_eq!(done.error, None);
        assert_eq!(done.chat_messages.len(), 1);
        assert_eq!(done.chat_messages[0].role, ChatRole::Model);
    }

    #[test]
    fn history_roundtrip_shares_file_and_preview() {
        let image = file("b.png");
        let preview = PreviewHandle::new(7, &image);
        let record = ImageRecord::pending("2-b.png", image.clone(), preview.clone())
            .succeeded(AnalysisResult::new(Classification::Real, "noise"));
        let entry = record.history_entry().unwrap();
        let restored = ImageRecord::from_history(&entry);
        assert_eq!(restored.preview, preview);
        assert!(restored.file.same_bytes(&image));
        assert_eq!(restored.chat_messages, record.chat_messages);
        assert_eq!(restored.highlight, None);
    }

    #[test]
    fn pending_record_has_no_history_entry() {
        let image = file("c.png");
        let record = ImageRecord::pending("3-c.png", image.clone(), PreviewHandle::new(3, &image));
        assert!(record.history_entry().is_none());
    }

    #[test]
    fn preview_data_url_uses_file_mime() {
        let image = ImageFile::new("d.jpg", "image/jpeg", vec![0xff, 0xd8]);
        let preview = PreviewHandle::new(9, &image);
        assert_eq!(preview.data_url(), "data:image/jpeg;base64,/9g=");
    }

    #[test]
    fn load_reads_bytes_and_guesses_mime() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("photo.JPG");
        std::fs::write(&path, b"jpegish")?;
        let image = ImageFile::load(&path)?;
        assert_eq!(image.name, "photo.JPG");
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.bytes(), b"jpegish");

        let empty = temp.path().join("empty.png");
        std::fs::write(&empty, b"")?;
        assert!(ImageFile::load(&empty).is_err());
        Ok(())
    }
}
