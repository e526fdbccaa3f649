//! Expert-council strategic advisory pipeline.
//!
//! A question goes through retrieval over the company knowledge base, fact
//! extraction, four domain specialists running concurrently, a synthesis pass
//! and a numeric verifier, and comes back as a [`DecisionSheet`].

pub mod citations;
pub mod config;
pub mod council;
pub mod facts;
pub mod kb;
pub mod llm;
pub mod numeric;
pub mod personas;
pub mod quality;
pub mod verify;

pub use config::{init_logging, PipelineConfig};
pub use council::sheet::{AnalysisRecord, DecisionSheet, SheetStatus};
pub use council::{CancelSignal, Pipeline};
pub use kb::KnowledgeBase;
pub use llm::{CompletionClient, CompletionError};
pub use personas::{Persona, PersonaCatalog};
