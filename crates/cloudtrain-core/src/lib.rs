//! cloudtrain core library
//!
//! Dataset packaging, training job orchestration, endpoint lifecycle and
//! inference glue on top of the `cloudtrain-service` traits.

pub mod artifacts;
pub mod command;
pub mod config;
pub mod dataset;
pub mod deploy;
pub mod error;
pub mod hosting;
pub mod inference;
pub mod pipeline;
pub mod session;
pub mod stage;
pub mod telemetry;
pub mod training;
pub mod training_env;
pub mod upload;

pub use artifacts::{retrieve_artifacts, RetrievedArtifacts};
pub use config::{
    DatasetConfig, HostingConfig, PipelineConfig, RunOptions, ServiceConfig, SessionConfig,
    TrainingConfig,
};
pub use dataset::{
    package, sample_images, Dataset, DatasetFetcher, FetchedDataset, PackagedDataset, Partition,
    Split, CLASS_NAMES,
};
pub use deploy::{deploy, reclaim, DeploySpec, EndpointHandle};
pub use error::{PipelineError, Result};
pub use hosting::{Predictor, ServingContainer, ServingHandler};
pub use inference::{argmax, predict, preprocess, ChannelOrder, Prediction, RawImage};
pub use pipeline::{dataset_prefixes, training_channels, PipelineReport, TrainingPipeline};
pub use session::Session;
pub use stage::{Stage, StageResult};
pub use telemetry::init_tracing;
pub use training::{launch, Hyperparameters, TrainingJob, TrainingJobSpec};
pub use training_env::TrainingEnv;
pub use upload::{upload_directory, upload_file, UploadReport, UploadedObject};
