//! Durable persistence: the per-turn document directories, the turn /
//! research / calibration indexes, and the knowledge corpus with its
//! staging area.
//!
//! Everything here is disk-backed and append-mostly. Indexes use a single
//! writer per file (advisory lock) with a read-through cache; turn
//! directories never contend across turns.

pub mod document;
pub mod index;
pub mod knowledge;
pub mod layout;
pub mod store;

pub use document::{parse_sections, ParsedDocument, ParsedSection};
pub use index::{CalibrationLog, ResearchIndex, ResearchIndexEntry, TurnIndex, TurnIndexEntry};
pub use knowledge::{KnowledgeStore, StagedKnowledge};
pub use layout::Layout;
pub use store::{StageMetric, TurnMetadata, TurnMetrics, TurnStore};
