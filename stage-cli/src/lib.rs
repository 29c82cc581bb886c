// Stage CLI
// Command implementations shared by the stagerun and slot-broker binaries

pub mod commands;
pub mod logging;
pub mod output;
