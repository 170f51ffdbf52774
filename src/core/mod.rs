pub mod agents;
pub mod config;
pub mod lifecycle;
pub mod llm;
pub mod office;
pub mod ops;
pub mod roundtable;
pub mod store;
pub mod terminal;
