//! Visual block programs for remote desktop automation
//!
//! A program graph exported by the block editor is compiled into a
//! [`CommandScript`] and run, one command at a time, against a remote
//! automation service that injects mouse, keyboard and browser input and
//! performs on-screen image matching.

pub mod client;
pub mod compiler;
pub mod config;
pub mod data_url;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod http;
pub mod instruction;
pub mod logging;
pub mod reference_cache;

pub use client::{
    CommandExecutor, CursorPosition, ImageAsset, ImageData, RemoteCommand, RemoteCommandClient,
    RemoteResponse, SavedProgram, Transport,
};
pub use compiler::compile;
pub use config::Config;
pub use engine::{
    ExecutionEngine, ExecutionLog, ExecutionSession, LogEntry, RunReport, RunStatus, Severity,
};
pub use errors::{CompileError, ConfigError, EngineError, GraphError, RemoteError};
pub use graph::{Block, BlockId, FieldValue, GraphBuilder, ProgramGraph};
pub use http::{connect, HttpClient, HttpTransport};
pub use instruction::{Command, CommandScript, Instruction, Location};
pub use reference_cache::{GraphEvent, ImageStore, ReferenceCache, RefreshSchedule};
