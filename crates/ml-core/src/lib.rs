//! Person detector backends.
//!
//! Every backend implements [`PersonDetector`] and returns boxes in frame
//! pixel coordinates after confidence filtering and non-maximum suppression.
//! [`RemoteDetector`] talks to an HTTP inference service and is always
//! available. Enable the `with-tch` feature for [`TorchScriptDetector`],
//! which pulls in the `tch` crate.

mod detector;
mod nms;
mod remote;
#[cfg(feature = "with-tch")]
mod torchscript;

pub use detector::{DetectorConfig, DetectorError, PersonDetector, timed_detect, validate_frame};
pub use nms::{iou, non_max_suppression};
pub use remote::{PERSON_CLASS, RemoteDetector};
#[cfg(feature = "with-tch")]
pub use torchscript::TorchScriptDetector;

#[cfg(feature = "with-tch")]
pub use tch;
