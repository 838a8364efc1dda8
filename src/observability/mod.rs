pub mod dispatch_trace;

pub use dispatch_trace::{
    load_events, resolve_trace_path, storage_mode_from_config, DispatchTrace, DispatchTraceEvent,
    TraceStorageMode,
};
