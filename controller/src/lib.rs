pub mod actions;
pub mod cli;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod sites;
pub mod state;
