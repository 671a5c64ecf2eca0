pub mod commands;
pub mod dedup;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod router;
pub mod supervisor;
