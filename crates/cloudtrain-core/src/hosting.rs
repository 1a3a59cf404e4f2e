//! Serving-side contract for the hosted model container.
//!
//! The hosting service loads a model once through [`ServingHandler::model_fn`]
//! and then answers each request with `input_fn -> predict_fn -> output_fn`.
//! Only `model_fn` has to be written; the other three default to the JSON
//! protocol spoken by [`crate::inference`].

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array4};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::dataset::{CHANNELS, IMAGE_SIDE};
use crate::error::{PipelineError, Result};
use crate::inference::JSON_CONTENT_TYPE;

/// A loaded model: `(N, 32, 32, 3)` in, `(N, classes)` probabilities out.
pub trait Predictor: Send + Sync {
    fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>>;
}

pub trait ServingHandler: Send + Sync {
    type Model: Predictor;

    /// Load the model unpacked from the artifact into `model_dir`.
    fn model_fn(&self, model_dir: &Path) -> Result<Self::Model>;

    /// Accepts either a bare nested array or `{"instances": [...]}`.
    fn input_fn(&self, body: &[u8], content_type: &str) -> Result<Array4<f32>> {
        if !is_json(content_type) {
            return Err(PipelineError::Serving(format!(
                "unsupported content type: {}",
                content_type
            )));
        }
        let value: Value = serde_json::from_slice(body)?;
        let instances = match value {
            Value::Object(mut map) => map
                .remove("instances")
                .ok_or_else(|| PipelineError::Serving("missing `instances`".to_string()))?,
            other => other,
        };
        instances_to_batch(&instances)
    }

    fn predict_fn(&self, batch: &Array4<f32>, model: &Self::Model) -> Result<Array2<f32>> {
        model.predict(batch)
    }

    fn output_fn(&self, predictions: &Array2<f32>, accept: &str) -> Result<(Vec<u8>, String)> {
        if !is_json(accept) {
            return Err(PipelineError::Serving(format!(
                "unsupported accept type: {}",
                accept
            )));
        }
        let rows: Vec<Vec<f32>> = predictions.outer_iter().map(|row| row.to_vec()).collect();
        let body = serde_json::to_vec(&json!({ "predictions": rows }))?;
        Ok((body, JSON_CONTENT_TYPE.to_string()))
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Flatten a `[N][32][32][3]` JSON array into a tensor, checking every level.
fn instances_to_batch(instances: &Value) -> Result<Array4<f32>> {
    let images = instances
        .as_array()
        .ok_or_else(|| PipelineError::Serving("instances must be an array".to_string()))?;
    let mut data = Vec::with_capacity(images.len() * IMAGE_SIDE * IMAGE_SIDE * CHANNELS);
    for (index, image) in images.iter().enumerate() {
        flatten_exact(image, &[IMAGE_SIDE, IMAGE_SIDE, CHANNELS], &mut data).map_err(|msg| {
            PipelineError::Serving(format!("instance {}: {}", index, msg))
        })?;
    }
    Ok(Array4::from_shape_vec(
        (images.len(), IMAGE_SIDE, IMAGE_SIDE, CHANNELS),
        data,
    )?)
}

fn flatten_exact(
    value: &Value,
    dims: &[usize],
    out: &mut Vec<f32>,
) -> std::result::Result<(), String> {
    match dims.split_first() {
        None => {
            let n = value
                .as_f64()
                .ok_or_else(|| format!("expected a number, found {}", value))?;
            out.push(n as f32);
            Ok(())
        }
        Some((&len, rest)) => {
            let items = value
                .as_array()
                .ok_or_else(|| "expected a nested array".to_string())?;
            if items.len() != len {
                return Err(format!("expected {} elements, found {}", len, items.len()));
            }
            items.iter().try_for_each(|item| flatten_exact(item, rest, out))
        }
    }
}

/// A handler with its model loaded, ready to answer requests.
pub struct ServingContainer<H: ServingHandler> {
    handler: H,
    model: H::Model,
    model_dir: PathBuf,
}

impl<H: ServingHandler> ServingContainer<H> {
    pub fn load(handler: H, model_dir: impl Into<PathBuf>) -> Result<Self> {
        let model_dir = model_dir.into();
        let model = handler.model_fn(&model_dir)?;
        info!(model_dir = %model_dir.display(), "model loaded");
        Ok(Self {
            handler,
            model,
            model_dir,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Returns the response body and its content type.
    pub fn serve_request(
        &self,
        body: &[u8],
        content_type: &str,
        accept: &str,
    ) -> Result<(Vec<u8>, String)> {
        let batch = self.handler.input_fn(body, content_type)?;
        let predictions = self.handler.predict_fn(&batch, &self.model)?;
        if predictions.nrows() != batch.shape()[0] {
            return Err(PipelineError::Serving(format!(
                "model returned {} rows for {} instances",
                predictions.nrows(),
                batch.shape()[0]
            )));
        }
        debug!(instances = batch.shape()[0], "request served");
        self.handler.output_fn(&predictions, accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{decode_response, encode_request};

    /// Puts all mass on the class given by the first pixel's red value.
    struct RedPixelModel;

    impl Predictor for RedPixelModel {
        fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>> {
            let mut out = Array2::zeros((batch.shape()[0], 10));
            for (i, image) in batch.outer_iter().enumerate() {
                let class = (image[[0, 0, 0]] as usize).min(9);
                out[[i, class]] = 1.0;
            }
            Ok(out)
        }
    }

    struct Handler;

    impl ServingHandler for Handler {
        type Model = RedPixelModel;

        fn model_fn(&self, model_dir: &Path) -> Result<RedPixelModel> {
            if model_dir.as_os_str().is_empty() {
                return Err(PipelineError::Serving("no model dir".to_string()));
            }
            Ok(RedPixelModel)
        }
    }

    fn batch_with_red(values: &[f32]) -> Array4<f32> {
        let mut batch = Array4::zeros((values.len(), IMAGE_SIDE, IMAGE_SIDE, CHANNELS));
        for (i, v) in values.iter().enumerate() {
            batch[[i, 0, 0, 0]] = *v;
        }
        batch
    }

    #[test]
    fn test_serve_instances_request() {
        let container = ServingContainer::load(Handler, "/opt/ml/model").unwrap();
        let body = encode_request(&batch_with_red(&[3.0, 7.0])).unwrap();
        let (response, content_type) = container
            .serve_request(&body, "application/json", "application/json")
            .unwrap();
        assert_eq!(content_type, JSON_CONTENT_TYPE);
        let predictions = decode_response(&response, 2).unwrap();
        assert_eq!(predictions[0][3], 1.0);
        assert_eq!(predictions[1][7], 1.0);
    }

    #[test]
    fn test_bare_array_is_accepted() {
        let container = ServingContainer::load(Handler, "/opt/ml/model").unwrap();
        let pixel = json!([0.0, 0.0, 0.0]);
        let row: Vec<Value> = vec![pixel; IMAGE_SIDE];
        let image: Vec<Value> = vec![Value::Array(row); IMAGE_SIDE];
        let body = serde_json::to_vec(&json!([image])).unwrap();
        let (response, _) = container
            .serve_request(&body, "application/json; charset=utf-8", "application/json")
            .unwrap();
        assert_eq!(decode_response(&response, 1).unwrap()[0][0], 1.0);
    }

    #[test]
    fn test_non_json_content_type_rejected() {
        let err = Handler.input_fn(b"abc", "text/csv").unwrap_err();
        assert!(matches!(err, PipelineError::Serving(_)));
    }

    #[test]
    fn test_wrong_image_shape_rejected() {
        let body = serde_json::to_vec(&json!({ "instances": [[[0.0, 0.0, 0.0]]] })).unwrap();
        let err = Handler.input_fn(&body, "application/json").unwrap_err();
        assert!(err.to_string().contains("instance 0"));
    }

    #[test]
    fn test_model_fn_failure_stops_load() {
        assert!(ServingContainer::load(Handler, "").is_err());
    }
}
