use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use super::errors::{Result, TranscodeError};

/// 输出格式最大长度
const MAX_FORMAT_LEN: usize = 10;

/// 输出质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(TranscodeError::InvalidSettings(format!("unknown quality '{}'", other))),
        }
    }
}

/// Target container/image format, e.g. `mp4` or `webp`.
///
/// Always lower-case ASCII alphanumeric so it can be used directly as a file
/// extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OutputFormat(String);

impl OutputFormat {
    pub fn new(format: &str) -> Result<Self> {
        let format = format.trim().trim_start_matches('.').to_ascii_lowercase();

        if format.is_empty() {
            return Err(TranscodeError::InvalidSettings("output format is empty".to_string()));
        }
        if format.len() > MAX_FORMAT_LEN || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TranscodeError::InvalidSettings(format!("invalid output format '{}'", format)));
        }

        Ok(Self(format))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OutputFormat {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self> {
        OutputFormat::new(s)
    }
}

impl<'de> Deserialize<'de> for OutputFormat {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        OutputFormat::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// 缩放尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Resize {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let width = NonZeroU32::new(width)
            .ok_or_else(|| TranscodeError::InvalidSettings("resize width must be positive".to_string()))?;
        let height = NonZeroU32::new(height)
            .ok_or_else(|| TranscodeError::InvalidSettings("resize height must be positive".to_string()))?;

        Ok(Self { width, height })
    }
}

impl FromStr for Resize {
    type Err = TranscodeError;

    /// Parses `WIDTHxHEIGHT`, e.g. `1920x1080`
    fn from_str(s: &str) -> Result<Self> {
        let (width, height) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| TranscodeError::InvalidSettings(format!("expected WIDTHxHEIGHT, got '{}'", s)))?;

        let parse = |value: &str| {
            value.trim().parse::<u32>().map_err(|err| {
                TranscodeError::InvalidSettings(format!("invalid resize dimension '{}': {}", value, err))
            })
        };

        Resize::new(parse(width)?, parse(height)?)
    }
}

/// Processing options snapshot attached to one upload.
///
/// Built through [`ProcessingSettingsBuilder`], which validates every field,
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessingSettings {
    quality: Quality,
    format: OutputFormat,
    add_subtitles: bool,
    extract_metadata: bool,
    optimize_for_web: bool,
    optimize_for_mobile: bool,
    resize: Option<Resize>,
}

impl ProcessingSettings {
    pub fn builder(format: &str) -> ProcessingSettingsBuilder {
        ProcessingSettingsBuilder::new(format)
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    pub fn add_subtitles(&self) -> bool {
        self.add_subtitles
    }

    pub fn extract_metadata(&self) -> bool {
        self.extract_metadata
    }

    pub fn optimize_for_web(&self) -> bool {
        self.optimize_for_web
    }

    pub fn optimize_for_mobile(&self) -> bool {
        self.optimize_for_mobile
    }

    pub fn resize(&self) -> Option<Resize> {
        self.resize
    }

    /// Multipart text fields sent next to the file part
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("outputFormat", self.format.to_string()),
            ("outputQuality", self.quality.to_string()),
        ];

        if let Some(resize) = self.resize {
            fields.push(("settings[resize]", "true".to_string()));
            fields.push(("settings[width]", resize.width.to_string()));
            fields.push(("settings[height]", resize.height.to_string()));
        }

        let flags = [
            ("settings[addSubtitles]", self.add_subtitles),
            ("settings[extractMetadata]", self.extract_metadata),
            ("settings[optimizeForWeb]", self.optimize_for_web),
            ("settings[optimizeForMobile]", self.optimize_for_mobile),
        ];
        for (name, enabled) in flags {
            if enabled {
                fields.push((name, "true".to_string()));
            }
        }

        fields
    }
}

/// 设置构建器
#[derive(Debug, Clone)]
pub struct ProcessingSettingsBuilder {
    quality: Quality,
    format: String,
    add_subtitles: bool,
    extract_metadata: bool,
    optimize_for_web: bool,
    optimize_for_mobile: bool,
    resize: Option<(u32, u32)>,
}

impl ProcessingSettingsBuilder {
    pub fn new(format: &str) -> Self {
        Self {
            quality: Quality::default(),
            format: format.to_string(),
            add_subtitles: false,
            extract_metadata: false,
            optimize_for_web: false,
            optimize_for_mobile: false,
            resize: None,
        }
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn add_subtitles(mut self, enabled: bool) -> Self {
        self.add_subtitles = enabled;
        self
    }

    pub fn extract_metadata(mut self, enabled: bool) -> Self {
        self.extract_metadata = enabled;
        self
    }

    pub fn optimize_for_web(mut self, enabled: bool) -> Self {
        self.optimize_for_web = enabled;
        self
    }

    pub fn optimize_for_mobile(mut self, enabled: bool) -> Self {
        self.optimize_for_mobile = enabled;
        self
    }

    pub fn resize(mut self, width: u32, height: u32) -> Self {
        self.resize = Some((width, height));
        self
    }

    pub fn build(self) -> Result<ProcessingSettings> {
        let format = OutputFormat::new(&self.format)?;
        let resize = match self.resize {
            Some((width, height)) => Some(Resize::new(width, height)?),
            None => None,
        };

        Ok(ProcessingSettings {
            quality: self.quality,
            format,
            add_subtitles: self.add_subtitles,
            extract_metadata: self.extract_metadata,
            optimize_for_web: self.optimize_for_web,
            optimize_for_mobile: self.optimize_for_mobile,
            resize,
        })
    }
}
