//! Automatic gating of cytometry samples: density estimation, peak extraction
//! by iterative thresholding, polygon reconciliation and population lookup.

pub mod density;
mod error;
pub mod events;
pub mod gate;
pub mod geometry;
pub mod homology;
pub mod options;
pub mod pipeline;
pub mod population;
pub mod protocol;
pub mod provider;
pub mod reconcile;
pub mod scale;

pub use error::{GatingError, Result};
pub use events::{Channel, EventMatrix, SampleEvents};
pub use gate::{Gate, GateShape, GateTemplate, PeakRecord};
pub use options::{GatingOptions, MachineType, ScaleKind};
pub use pipeline::Pipeline;
pub use protocol::{JobFailure, JobRequest, JobResponse};
pub use provider::{FileMatrixProvider, InMemoryProvider, MatrixProvider, SampleRef};
