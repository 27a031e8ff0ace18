//! QA Pipeline - Rust Implementation
//!
//! Turns recorded agent call traces into question/answer units, runs them
//! through a staged pipeline over a pluggable message queue and publishes
//! reviewed answers to a knowledge base.
//!
//! # Overview
//!
//! - Trace extraction: batch import over a time window and real-time collection
//! - Message queue abstraction with in-memory and MQTT backends, retries and dead letters
//! - Stage processors: quality, dispatcher, review and knowledge
//! - Task store with a compare-and-set status machine
//! - Annotation, review and progress operations for the task service
//!
//! # Quick Start
//!
//! ```rust
//! use qa_pipeline::model::{Category, TaskStatus, UnitDraft};
//!
//! let unit = UnitDraft {
//!     trace_id: "trace-1".to_string(),
//!     request_id: "req-1".to_string(),
//!     group_id: String::new(),
//!     caller: "user".to_string(),
//!     callee: "planner".to_string(),
//!     caller_category: Category::User,
//!     callee_category: Category::Agent,
//!     call_chain: vec!["user".to_string(), "planner".to_string()],
//!     question: "What is 17 * 23?".to_string(),
//!     answer: "17 * 23 = 391".to_string(),
//!     batch_id: None,
//!     parent_id: None,
//! }
//! .into_root_unit();
//!
//! assert!(unit.is_root());
//! assert_eq!(unit.status_path(), vec![TaskStatus::Pending]);
//! ```

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod health;
pub mod importer;
pub mod model;
pub mod mq;
pub mod observability;
pub mod processors;
pub mod runtime;
pub mod service;
pub mod store;
pub mod testing;
pub mod trace;

pub use config::*;
pub use error::{PipelineError, PipelineResult};
pub use model::*;
pub use mq::{MessageQueue, MqError, MqMessage, Topic};
pub use runtime::{PipelineParts, PipelineRuntime};
pub use service::TaskService;
