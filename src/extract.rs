//! Signal extraction contracts and the file-sidecar implementation used by
//! the CLI.
//!
//! Real encoders (an image/text model, an OCR engine) live outside this
//! crate and plug in through [`FeatureExtractor`] and [`TextRecognizer`].

use crate::AffinityError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Produces vectors for images and text in one shared space.
pub trait FeatureExtractor: Send + Sync {
    fn image_vector(&self, image: &Path) -> Result<Vec<f32>, AffinityError>;
    /// `None` when the backend has no text encoder.
    fn text_vector(&self, text: &str) -> Result<Option<Vec<f32>>, AffinityError>;
}

/// OCR: reads the profile text printed on a screenshot.
pub trait TextRecognizer: Send + Sync {
    fn bio_text(&self, image: &Path) -> Result<String, AffinityError>;
}

/// Reads precomputed signals stored next to each image:
/// `x.jpg.vec.json` holds the vector, `x.jpg.txt` the recognised text.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarExtractor;

fn sidecar(image: &Path, suffix: &str) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl FeatureExtractor for SidecarExtractor {
    fn image_vector(&self, image: &Path) -> Result<Vec<f32>, AffinityError> {
        let path = sidecar(image, ".vec.json");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            AffinityError::Extraction(format!("{}: {e}", path.display()))
        })?;
        let v: Vec<f32> = serde_json::from_str(&raw).map_err(|e| {
            AffinityError::Extraction(format!("{}: {e}", path.display()))
        })?;
        if v.is_empty() || v.iter().any(|x| !x.is_finite()) {
            return Err(AffinityError::Extraction(format!(
                "{}: vector must be non-empty and finite",
                path.display()
            )));
        }
        Ok(crate::vector::normalize(&v))
    }

    fn text_vector(&self, _text: &str) -> Result<Option<Vec<f32>>, AffinityError> {
        Ok(None)
    }
}

impl TextRecognizer for SidecarExtractor {
    fn bio_text(&self, image: &Path) -> Result<String, AffinityError> {
        let path = sidecar(image, ".txt");
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) => Err(AffinityError::Extraction(format!("{}: {e}", path.display()))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileFields {
    pub name: Option<String>,
    pub age: Option<u32>,
}

static NAME_AGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z ]+),?\s*(\d{2})\b").ok());

/// Pull "Name, 27" from the first non-empty line of recognised text.
pub fn parse_profile_fields(text: &str) -> ProfileFields {
    let Some(re) = NAME_AGE.as_ref() else {
        return ProfileFields::default();
    };
    let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return ProfileFields::default();
    };
    match re.captures(line) {
        Some(c) => {
            let name = c[1].trim();
            ProfileFields {
                name: (!name.is_empty()).then(|| name.to_string()),
                age: c[2].parse().ok(),
            }
        }
        None => ProfileFields::default(),
    }
}
