//! Environment the training service injects into the script container.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const MODEL_DIR_VAR: &str = "SM_MODEL_DIR";
pub const OUTPUT_DATA_DIR_VAR: &str = "SM_OUTPUT_DATA_DIR";
pub const NUM_GPUS_VAR: &str = "SM_NUM_GPUS";
pub const CHANNEL_VAR_PREFIX: &str = "SM_CHANNEL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingEnv {
    /// Where the script saves the trained model
    pub model_dir: PathBuf,
    /// Where the script writes plots and other auxiliary output
    pub output_data_dir: PathBuf,
    pub num_gpus: u32,
    /// Channel name (lowercase) to local data directory
    pub channels: BTreeMap<String, PathBuf>,
}

impl TrainingEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> =
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();

        let required = |name: &str| {
            vars.get(name)
                .map(PathBuf::from)
                .ok_or_else(|| PipelineError::MissingEnv(name.to_string()))
        };
        let model_dir = required(MODEL_DIR_VAR)?;
        let output_data_dir = required(OUTPUT_DATA_DIR_VAR)?;

        let num_gpus = match vars.get(NUM_GPUS_VAR) {
            None => 0,
            Some(value) => value.trim().parse().map_err(|_| PipelineError::InvalidEnv {
                name: NUM_GPUS_VAR.to_string(),
                value: value.clone(),
            })?,
        };

        let channels = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(CHANNEL_VAR_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_ascii_lowercase(), PathBuf::from(value)))
            })
            .collect();

        Ok(Self {
            model_dir,
            output_data_dir,
            num_gpus,
            channels,
        })
    }

    /// Inverse of [`TrainingEnv::from_vars`].
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            MODEL_DIR_VAR.to_string(),
            self.model_dir.display().to_string(),
        );
        vars.insert(
            OUTPUT_DATA_DIR_VAR.to_string(),
            self.output_data_dir.display().to_string(),
        );
        vars.insert(NUM_GPUS_VAR.to_string(), self.num_gpus.to_string());
        for (name, dir) in &self.channels {
            vars.insert(
                format!("{}{}", CHANNEL_VAR_PREFIX, name.to_ascii_uppercase()),
                dir.display().to_string(),
            );
        }
        vars
    }

    pub fn channel(&self, name: &str) -> Result<&PathBuf> {
        self.channels
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| {
                PipelineError::MissingEnv(format!(
                    "{}{}",
                    CHANNEL_VAR_PREFIX,
                    name.to_ascii_uppercase()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SM_MODEL_DIR", "/opt/ml/model"),
            ("SM_OUTPUT_DATA_DIR", "/opt/ml/output/data"),
            ("SM_CHANNEL_TRAIN", "/opt/ml/input/data/train"),
            ("SM_CHANNEL_TEST", "/opt/ml/input/data/test"),
            ("PATH", "/usr/bin"),
        ]
    }

    #[test]
    fn test_parses_channels_and_defaults_gpus() {
        let env = TrainingEnv::from_vars(base()).unwrap();
        assert_eq!(env.model_dir, PathBuf::from("/opt/ml/model"));
        assert_eq!(env.num_gpus, 0);
        assert_eq!(env.channels.len(), 2);
        assert_eq!(
            env.channel("train").unwrap(),
            &PathBuf::from("/opt/ml/input/data/train")
        );
        assert!(matches!(
            env.channel("validation"),
            Err(PipelineError::MissingEnv(ref v)) if v == "SM_CHANNEL_VALIDATION"
        ));
    }

    #[test]
    fn test_missing_model_dir() {
        let vars: Vec<_> = base()
            .into_iter()
            .filter(|(k, _)| *k != "SM_MODEL_DIR")
            .collect();
        let err = TrainingEnv::from_vars(vars).unwrap_err();
        assert!(matches!(err, PipelineError::MissingEnv(ref v) if v == "SM_MODEL_DIR"));
    }

    #[test]
    fn test_invalid_gpu_count() {
        let mut vars = base();
        vars.push(("SM_NUM_GPUS", "many"));
        let err = TrainingEnv::from_vars(vars).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidEnv { .. }));
    }

    #[test]
    fn test_to_env_round_trips() {
        let mut vars = base();
        vars.push(("SM_NUM_GPUS", "4"));
        let env = TrainingEnv::from_vars(vars).unwrap();
        assert_eq!(env.num_gpus, 4);
        let again = TrainingEnv::from_vars(env.to_env()).unwrap();
        assert_eq!(again, env);
    }
}
