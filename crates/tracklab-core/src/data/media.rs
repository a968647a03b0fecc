//! Media values: text, audio and images.
//!
//! Audio and images are validated and encoded when they are constructed
//! (WAV via `hound`, PNG via `image`), so a malformed value is rejected at
//! the call site with a [`ConstructionError`] instead of deep inside a run.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;

// ─── Raw arrays ───────────────────────────────────────────────────────────────

/// Flat numeric buffer with an element type, as produced by array libraries.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I16(Vec<i16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl ArrayData {
    pub fn dtype(&self) -> &'static str {
        match self {
            ArrayData::F32(_) => "float32",
            ArrayData::F64(_) => "float64",
            ArrayData::I32(_) => "int32",
            ArrayData::I16(_) => "int16",
            ArrayData::I8(_) => "int8",
            ArrayData::U8(_) => "uint8",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! array_data_from {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<Vec<$t>> for ArrayData {
            fn from(v: Vec<$t>) -> Self {
                ArrayData::$variant(v)
            }
        })*
    };
}

array_data_from!(f32 => F32, f64 => F64, i32 => I32, i16 => I16, i8 => I8, u8 => U8);

/// Row-major n-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    data: ArrayData,
    shape: Vec<usize>,
}

impl Array {
    pub fn new(data: impl Into<ArrayData>, shape: Vec<usize>) -> Result<Self, ConstructionError> {
        let data = data.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ConstructionError::ShapeMismatch {
                len: data.len(),
                shape,
            });
        }
        Ok(Self { data, shape })
    }

    /// One-dimensional array over `data`.
    pub fn from_vec(data: impl Into<ArrayData>) -> Self {
        let data = data.into();
        let shape = vec![data.len()];
        Self { data, shape }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> &'static str {
        self.data.dtype()
    }
}

// ─── Text ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(String);

impl Text {
    pub fn new(content: impl Into<String>) -> Self {
        Text(content.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ─── Audio ────────────────────────────────────────────────────────────────────

const AUDIO_DTYPES: &str = "float32, float64, int16 or int32";

/// Encoded WAV audio.
#[derive(Debug, Clone)]
pub struct Audio {
    bytes: Arc<[u8]>,
    sample_rate: u32,
    channels: u16,
    caption: Option<String>,
}

impl Audio {
    /// Read a WAV file. The bytes are kept as-is after validation.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConstructionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConstructionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let (spec, duration) = {
            let reader = hound::WavReader::new(Cursor::new(bytes.as_slice()))?;
            (reader.spec(), reader.duration())
        };
        if duration == 0 {
            return Err(ConstructionError::EmptyData);
        }
        Ok(Self {
            bytes: Arc::from(bytes),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            caption: None,
        })
    }

    /// Encode a sample array of shape `(samples)` or `(channels, samples)`
    /// with at most two channels.
    pub fn from_array(array: Array, sample_rate: u32) -> Result<Self, ConstructionError> {
        if sample_rate == 0 {
            return Err(ConstructionError::InvalidSampleRate);
        }
        let samples = audio_samples(&array.data)?;
        let (channels, frames) = match array.shape.as_slice() {
            [n] => (1usize, *n),
            [c, n] if (1..=2).contains(c) => (*c, *n),
            other => {
                return Err(ConstructionError::InvalidShape {
                    expected: "(samples) or (channels <= 2, samples)",
                    got: other.to_vec(),
                })
            }
        };
        if frames == 0 {
            return Err(ConstructionError::EmptyData);
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(ConstructionError::Encode {
                kind: "audio",
                message: "samples must be finite".into(),
            });
        }

        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(encode_audio)?;
            // channel-first input, interleaved output
            for frame in 0..frames {
                for channel in 0..channels {
                    writer
                        .write_sample(samples[channel * frames + frame])
                        .map_err(encode_audio)?;
                }
            }
            writer.finalize().map_err(encode_audio)?;
        }

        Ok(Self {
            bytes: Arc::from(cursor.into_inner()),
            sample_rate,
            channels: channels as u16,
            caption: None,
        })
    }

    /// Mono audio from float samples.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Result<Self, ConstructionError> {
        Self::from_array(Array::from_vec(samples), sample_rate)
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub(crate) fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

fn audio_samples(data: &ArrayData) -> Result<Vec<f32>, ConstructionError> {
    match data {
        ArrayData::F32(v) => Ok(v.clone()),
        ArrayData::F64(v) => Ok(v.iter().map(|s| *s as f32).collect()),
        ArrayData::I16(v) => Ok(v.iter().map(|s| *s as f32 / 32_768.0).collect()),
        ArrayData::I32(v) => Ok(v.iter().map(|s| *s as f32 / 2_147_483_648.0).collect()),
        other => Err(ConstructionError::UnsupportedDtype {
            expected: AUDIO_DTYPES,
            got: other.dtype(),
        }),
    }
}

fn encode_audio(e: hound::Error) -> ConstructionError {
    ConstructionError::Encode {
        kind: "audio",
        message: e.to_string(),
    }
}

// ─── Image ────────────────────────────────────────────────────────────────────

const IMAGE_DTYPES: &str = "float32, float64 or uint8";

/// Encoded PNG image.
#[derive(Debug, Clone)]
pub struct Image {
    bytes: Arc<[u8]>,
    width: u32,
    height: u32,
    caption: Option<String>,
}

impl Image {
    /// Decode any format `image` understands and re-encode as PNG.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConstructionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConstructionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let img = image::load_from_memory(&bytes)?;
        Self::from_dynamic(img)
    }

    pub fn from_dynamic(img: DynamicImage) -> Result<Self, ConstructionError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(ConstructionError::EmptyData);
        }
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Png)
            .map_err(|e| ConstructionError::Encode {
                kind: "image",
                message: e.to_string(),
            })?;
        Ok(Self {
            bytes: Arc::from(cursor.into_inner()),
            width: img.width(),
            height: img.height(),
            caption: None,
        })
    }

    /// Build from an `(H, W)` or `(H, W, C)` array, `C` in {1, 3, 4}.
    /// Float input is expected in `[0, 1]`.
    pub fn from_array(array: Array) -> Result<Self, ConstructionError> {
        let (height, width, channels) = match array.shape.as_slice() {
            [h, w] => (*h, *w, 1usize),
            [h, w, c] if matches!(c, 1 | 3 | 4) => (*h, *w, *c),
            other => {
                return Err(ConstructionError::InvalidShape {
                    expected: "(H, W) or (H, W, C) with C in {1, 3, 4}",
                    got: other.to_vec(),
                })
            }
        };
        if height == 0 || width == 0 {
            return Err(ConstructionError::EmptyData);
        }
        let pixels = image_pixels(&array.data)?;
        let (w, h) = (width as u32, height as u32);
        let img = match channels {
            1 => GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
            _ => RgbaImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
        }
        .ok_or_else(|| ConstructionError::Encode {
            kind: "image",
            message: "pixel buffer does not fit image dimensions".into(),
        })?;
        Self::from_dynamic(img)
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub(crate) fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

fn image_pixels(data: &ArrayData) -> Result<Vec<u8>, ConstructionError> {
    fn scale(v: f64) -> Result<u8, ConstructionError> {
        if !v.is_finite() {
            return Err(ConstructionError::Encode {
                kind: "image",
                message: "pixel values must be finite".into(),
            });
        }
        Ok((v.clamp(0.0, 1.0) * 255.0).round() as u8)
    }

    match data {
        ArrayData::U8(v) => Ok(v.clone()),
        ArrayData::F32(v) => v.iter().map(|p| scale(*p as f64)).collect(),
        ArrayData::F64(v) => v.iter().map(|p| scale(*p)).collect(),
        other => Err(ConstructionError::UnsupportedDtype {
            expected: IMAGE_DTYPES,
            got: other.dtype(),
        }),
    }
}

// ─── Buffers ──────────────────────────────────────────────────────────────────

/// Encoded media bytes tagged with their upload path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaBuffer {
    pub path: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Arc<[u8]>,
}

impl MediaBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

mod base64_bytes {
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Arc<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<[u8]>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Arc::from)
            .map_err(serde::de::Error::custom)
    }
}
