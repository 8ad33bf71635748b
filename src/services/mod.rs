pub mod dispatch;
pub mod features;
pub mod ingest;
pub mod pipeline;
pub mod push;
pub mod rule_engine;
pub mod scheduler;
pub mod scoring;
pub mod similarity;
