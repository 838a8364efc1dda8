#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Correlation layer between an async Rust caller and a native library that
//! answers on a single unordered channel.
//!
//! Calls are matched to replies by operation key in FIFO order; everything
//! that does not complete a call (task progress, task completion, unsolicited
//! callbacks) is fanned out on a broadcast stream.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod native;
pub mod observability;
pub mod protocol;
pub mod tasks;

pub use config::BridgeConfig;
pub use engine::{CorrelationEngine, DispatchOutcome, EngineStats, PendingReply};
pub use error::BridgeError;
pub use events::{BridgeEvent, BroadcastListener, EventClass, Subscription};
pub use native::{InboundPort, LoopbackNative, NativeBackend};
pub use protocol::{parse, InboundMessage, ParsedResponse, PayloadFormat, TaskHandle};
pub use tasks::{TaskEvent, TaskProgress, TaskWatcher};
