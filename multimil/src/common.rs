pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f32>;

pub use crate::error::{MultimilError, Result};

pub use candle_util::{candle_core, candle_nn};
