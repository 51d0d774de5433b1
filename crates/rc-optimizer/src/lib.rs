//! # rc-optimizer
//!
//! Persistent parameter studies for soil calibration.
//!
//! Provides search space definitions, TPE and random samplers, a median
//! pruner, and study stores (SQLite or an append-only journal) that several
//! worker processes can share. A [`Study`] ties them together behind an
//! ask/tell interface.

mod pruner;
mod sampler;
mod search;
mod storage;
mod study;
mod trial;

pub use pruner::{MedianPruner, NopPruner, Pruner};
pub use sampler::{gamma, RandomSampler, Sampler, TpeSampler};
pub use search::{ParameterDef, ParameterKind, Params, SearchSpace};
pub use storage::{open_storage, JournalStorage, SqliteStorage, StorageResult, StudyStorage};
pub use study::Study;
pub use trial::{best_trial, FrozenTrial, StudyDirection, StudyId, StudySummary, TrialId, TrialState};
