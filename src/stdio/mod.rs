//! Stdio transport: human REPL or line-delimited JSON, selected by mode.

pub mod headless;
pub mod interactive;
