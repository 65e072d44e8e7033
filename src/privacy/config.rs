use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::privacy::error::{PrivacyError, Result};
use crate::settings::types::Preferences;

pub const MIN_BLUR_RADIUS: f32 = 5.0;
pub const MAX_BLUR_RADIUS: f32 = 100.0;
pub const DEFAULT_BLUR_RADIUS: f32 = 30.0;

/// What viewers see while privacy is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivacyMode {
    #[default]
    #[serde(rename = "Blur")]
    Blur,
    #[serde(rename = "Custom Image")]
    Image,
    #[serde(rename = "Black Screen")]
    Black,
}

impl PrivacyMode {
    pub const ALL: [PrivacyMode; 3] = [Self::Blur, Self::Image, Self::Black];

    /// Label shown in the mode picker (also the persisted value).
    pub fn label(self) -> &'static str {
        match self {
            Self::Blur => "Blur",
            Self::Image => "Custom Image",
            Self::Black => "Black Screen",
        }
    }
}

/// Process-wide privacy configuration.
///
/// Published through the frame bus as an immutable snapshot; writers build a
/// new value and swap it in.
#[derive(Debug, Clone)]
pub struct PrivacyConfig {
    pub mode: PrivacyMode,
    blur_radius: f32,
    pub custom_image: Option<Arc<RgbaImage>>,
    pub enabled: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mode: PrivacyMode::default(),
            blur_radius: DEFAULT_BLUR_RADIUS,
            custom_image: None,
            enabled: false,
        }
    }
}

impl PrivacyConfig {
    /// Build from loaded preferences. Privacy always starts disabled.
    ///
    /// An unreadable custom image is logged and left unset.
    pub fn from_preferences(prefs: &Preferences) -> Self {
        let custom_image = prefs
            .custom_image_path
            .as_deref()
            .and_then(|path| match load_custom_image(path) {
                Ok(image) => Some(Arc::new(image)),
                Err(e) => {
                    tracing::warn!("{e}");
                    None
                }
            });
        Self {
            mode: prefs.privacy_mode,
            blur_radius: clamp_blur_radius(prefs.blur_radius),
            custom_image,
            enabled: false,
        }
    }

    pub fn with_mode(mut self, mode: PrivacyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_blur_radius(mut self, radius: f32) -> Self {
        self.set_blur_radius(radius);
        self
    }

    pub fn with_custom_image(mut self, image: RgbaImage) -> Self {
        self.custom_image = Some(Arc::new(image));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn blur_radius(&self) -> f32 {
        self.blur_radius
    }

    /// Set the blur radius, clamped to [5, 100].
    pub fn set_blur_radius(&mut self, radius: f32) {
        self.blur_radius = clamp_blur_radius(radius);
    }
}

/// Clamp to the supported range; non-finite input falls back to the default.
pub fn clamp_blur_radius(radius: f32) -> f32 {
    if radius.is_finite() {
        radius.clamp(MIN_BLUR_RADIUS, MAX_BLUR_RADIUS)
    } else {
        DEFAULT_BLUR_RADIUS
    }
}

/// Decode an image file into RGBA pixels.
pub fn load_custom_image(path: &Path) -> Result<RgbaImage> {
    image::open(path)
        .map(|img| img.to_rgba8())
        .map_err(|e| PrivacyError::ImageLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
