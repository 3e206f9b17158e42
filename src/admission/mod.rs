//! Admission control: the synchronous request path.

mod gate;
mod response;

pub use gate::{retry_after_secs, AdmissionDecision, AdmissionGate};
pub use response::CallerResponse;
