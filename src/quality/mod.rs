pub mod reinforcer;
pub mod validator;

pub use reinforcer::{QualityStats, QualityTracker, Trend};
pub use validator::{validate, Grade, ValidationReport};
