//! cloudtrain-service: the managed ML service seam
//!
//! Everything this repository asks of the external service (identity, object
//! storage, training jobs, model hosting, prediction) goes through the traits
//! in [`service_traits`]. Two backends implement them:
//!
//! - [`rest::RestCloud`]: JSON over HTTPS via `reqwest`
//! - [`fakes::MemoryCloud`]: in-memory, for tests and dry runs

mod error;
pub mod fakes;
pub mod rest;
pub mod service_traits;

pub use error::ServiceError;
pub use rest::{RestCloud, RestConfig};
pub use service_traits::{
    CallerIdentity, EndpointDescription, EndpointRequest, EndpointStatus, HostingService,
    IdentityProvider, JobStatus, ManagedCloud, ModelRequest, ObjectStore, ObjectUri,
    PredictionService, ResourceSpec, ScriptRef, ServiceResult, TrainingJobDescription,
    TrainingJobRequest, TrainingService,
};
