pub mod protocol;
pub mod spec;

pub use spec::{PipelineSpec, SpecDocument, SpecError, Stage};
