pub mod compaction;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod event;
pub mod paths;
pub mod protocol;
pub mod resume;
pub mod session;
pub mod supervisor;
pub mod tokens;
