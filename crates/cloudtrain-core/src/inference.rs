//! Inference client: image preprocessing, request framing, argmax.
//!
//! A batch is sent as a single JSON request `{"instances": [...]}` holding
//! channels-last `f32` images in `[0, 1]`. The endpoint answers
//! `{"predictions": [[p0, .., p9], ...]}` with one probability vector per
//! image, in input order.

use ndarray::{Array4, ArrayView1};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use cloudtrain_service::PredictionService;

use crate::dataset::{class_name, CHANNELS, IMAGE_BYTES, IMAGE_SIDE, PLANE_BYTES};
use crate::deploy::EndpointHandle;
use crate::error::{PipelineError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Byte layout of a raw 32x32 colour image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    /// Three 1024-byte planes R, G, B (dataset record layout)
    PlanarRgb,
    /// Pixel-interleaved R, G, B
    InterleavedRgb,
    /// Pixel-interleaved B, G, R
    InterleavedBgr,
}

/// An undecoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    bytes: Vec<u8>,
    order: ChannelOrder,
}

impl RawImage {
    pub fn new(bytes: Vec<u8>, order: ChannelOrder) -> Result<Self> {
        if bytes.len() != IMAGE_BYTES {
            return Err(PipelineError::Dataset(format!(
                "image must be {} bytes, got {}",
                IMAGE_BYTES,
                bytes.len()
            )));
        }
        Ok(Self { bytes, order })
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    /// Decode into channels-last RGB (`y`, `x`, `c` row-major).
    pub fn to_hwc_rgb(&self) -> Vec<u8> {
        let mut out = vec![0u8; IMAGE_BYTES];
        for pixel in 0..PLANE_BYTES {
            for channel in 0..CHANNELS {
                out[pixel * CHANNELS + channel] = match self.order {
                    ChannelOrder::PlanarRgb => self.bytes[channel * PLANE_BYTES + pixel],
                    ChannelOrder::InterleavedRgb => self.bytes[pixel * CHANNELS + channel],
                    ChannelOrder::InterleavedBgr => {
                        self.bytes[pixel * CHANNELS + (CHANNELS - 1 - channel)]
                    }
                };
            }
        }
        out
    }
}

/// Decode, reorder to RGB, scale to `[0, 1]` and stack into `(N, 32, 32, 3)`.
pub fn preprocess(images: &[RawImage]) -> Result<Array4<f32>> {
    let mut data = Vec::with_capacity(images.len() * IMAGE_BYTES);
    for image in images {
        data.extend(image.to_hwc_rgb().into_iter().map(|v| v as f32 / 255.0));
    }
    Ok(Array4::from_shape_vec(
        (images.len(), IMAGE_SIDE, IMAGE_SIDE, CHANNELS),
        data,
    )?)
}

/// Index of the largest element; ties resolve to the lowest index.
/// Returns `None` for an empty vector.
pub fn argmax(values: ArrayView1<'_, f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, top)) if !(value > top) => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// One interpreted prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: usize,
    pub class_name: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self> {
        let label = argmax(ArrayView1::from(probabilities))
            .ok_or_else(|| PipelineError::Prediction("empty probability vector".to_string()))?;
        Ok(Self {
            label,
            class_name: class_name(label).unwrap_or("unknown").to_string(),
            confidence: probabilities[label],
        })
    }
}

/// Serialize a batch as `{"instances": [[[[r, g, b], ...], ...], ...]}`.
pub fn encode_request(batch: &Array4<f32>) -> Result<Vec<u8>> {
    let instances: Vec<Vec<Vec<Vec<f32>>>> = batch
        .outer_iter()
        .map(|image| {
            image
                .outer_iter()
                .map(|row| row.outer_iter().map(|pixel| pixel.to_vec()).collect())
                .collect()
        })
        .collect();
    Ok(serde_json::to_vec(&json!({ "instances": instances }))?)
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    predictions: Vec<Vec<f32>>,
}

/// Parse `{"predictions": [...]}`, checking one vector per input image.
pub fn decode_response(body: &[u8], expected: usize) -> Result<Vec<Vec<f32>>> {
    let response: PredictionResponse = serde_json::from_slice(body)?;
    if response.predictions.len() != expected {
        return Err(PipelineError::Prediction(format!(
            "expected {} predictions, endpoint returned {}",
            expected,
            response.predictions.len()
        )));
    }
    Ok(response.predictions)
}

/// Send every image in one request and interpret the answer.
pub async fn predict<P>(
    service: &P,
    endpoint: &EndpointHandle,
    images: &[RawImage],
) -> Result<Vec<Prediction>>
where
    P: PredictionService + ?Sized,
{
    let batch = preprocess(images)?;
    let body = encode_request(&batch)?;
    debug!(
        endpoint = %endpoint.endpoint_name,
        images = images.len(),
        bytes = body.len(),
        "invoking endpoint"
    );
    let response = service
        .invoke_endpoint(&endpoint.endpoint_name, JSON_CONTENT_TYPE, body)
        .await?;
    let predictions = decode_response(&response, images.len())?
        .iter()
        .map(|probabilities| Prediction::from_probabilities(probabilities))
        .collect::<Result<Vec<_>>>()?;
    info!(
        endpoint = %endpoint.endpoint_name,
        predictions = predictions.len(),
        "prediction batch complete"
    );
    Ok(predictions)
}
