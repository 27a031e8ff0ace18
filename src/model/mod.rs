//! Domain model: QA units, annotations, classification and lifecycle

pub mod annotation;
pub mod classify;
pub mod messages;
pub mod status;
pub mod tree;
pub mod unit;

pub use annotation::{Annotation, AnnotationInput, CorrectionType, QualityLabel, ReviewOutcome};
pub use classify::{classify, Category, Classification, Priority, SourceType};
pub use messages::{KnowledgeEntry, ReviewDecision};
pub use status::TaskStatus;
pub use tree::{TreeNode, UnitTree};
pub use unit::{content_hash, QAUnit, QualityAssessment, StatusChange, UnitDraft};
