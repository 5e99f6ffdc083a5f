//! Detection model seam and post-processing shared by the inference worker.

pub mod detection;
#[cfg(feature = "with-tch")]
pub mod detector;

pub use detection::{Detection, DetectionModel, ItemClass, non_max_suppression, top_by_score};

#[cfg(feature = "with-tch")]
pub use tch;
