pub mod common;
pub mod error;

pub mod config;

pub mod aggregator;
pub mod covariates;
pub mod fusion;
pub mod integration;
pub mod mil;
pub mod modality;
pub mod similarity;
pub mod vae;

pub mod dataset;
pub mod history;
pub mod io;
pub mod loss;
pub mod model;
pub mod simulate;
pub mod train;

pub use config::{LossCoefs, MilConfig, MultiMilConfig, VaeConfig};
pub use dataset::{MultimodalData, SetupArgs};
pub use error::{MultimilError, Result};
pub use model::MultiMil;
pub use train::TrainConfig;
