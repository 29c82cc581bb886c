pub mod broker;
pub mod run;
pub mod slot;
