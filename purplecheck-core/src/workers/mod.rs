//! Worker runtime and detector back-ends

pub mod detector;
pub mod http;
pub mod mock;
pub mod registry;
pub mod runtime;

pub use detector::{Detection, Detector, DetectorError, DetectorResult};
pub use http::HttpApiDetector;
pub use mock::MockDetector;
pub use registry::DetectorRegistry;
pub use runtime::{WorkerKind, WorkerRuntime};
