//! # fuseflow core
//!
//! Credit-based backpressure for message-passing stream stages.
//!
//! A [`Stage`] multiplexes one or more independently typed streams behind a
//! single handshake and slot namespace. Every typed stream keeps its own
//! flow-control accounting; the stage only aggregates congestion and
//! completion.
//!
//! This crate provides:
//! - **Paths & credit**: per-path credit counters and the periodic credit
//!   round ([`path`], [`credit`])
//! - **Scatterers**: buffered, credit-respecting dispatch of one element
//!   type ([`scatterer`]) and the fusion of several types ([`fused`])
//! - **Stages**: the stream manager state machine ([`stage`]) plus source
//!   and sink drivers ([`source`], [`sink`])
//! - **Local runtime**: a deterministic in-process host ([`runtime`])
//!
//! ## Design Principles
//!
//! 1. **Credit before data** - nothing is sent without granted credit
//! 2. **Independent streams** - one type finishing never blocks another
//! 3. **Closed payloads** - batch types are a tagged union, not runtime casts
//! 4. **Injected time** - all timing goes through a [`Clock`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use fuseflow_core::{make_sink, make_source, LocalRuntime, StageConfig};
//!
//! fuseflow_core::stream_payload! {
//!     pub enum Msg {
//!         Ints(i64) => "i64",
//!     }
//! }
//!
//! let mut rt = LocalRuntime::<Msg>::new();
//! let source = rt.spawn(|id, clock| make_source(id, StageConfig::default(), clock, ..))?;
//! let sink = rt.spawn(|id, clock| make_sink(id, StageConfig::default(), clock, ..))?;
//! rt.connect(source.id(), sink.id(), TypeTag::new("i64"))?;
//! rt.run_until(LocalRuntime::all_done, Duration::from_millis(10), 1_000)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod credit;
pub mod error;
pub mod fused;
pub mod message;
pub mod path;
pub mod payload;
pub mod runtime;
pub mod scatterer;
pub mod sink;
pub mod source;
pub mod stage;

// Re-export key types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CreditConfig, DispatchPolicy, StageConfig};
pub use credit::CreditController;
pub use error::StreamError;
pub use fused::FusedScatterer;
pub use message::{Batch, CloseReason, Envelope, FusedLayout, StreamMsg};
pub use path::{Direction, Path, PathState, Peer, SlotId, StageId};
pub use payload::{Element, Payload, TypeTag};
pub use runtime::{LocalRuntime, NodeHandle, StreamNode};
pub use scatterer::Scatterer;
pub use sink::{make_sink, SinkStage};
pub use source::{make_source, SourceStage};
pub use stage::{Forward, Stage, StageBuilder, StageLogic, StageMetrics, StageState};

/// Result type for fuseflow operations
pub type Result<T> = std::result::Result<T, StreamError>;
