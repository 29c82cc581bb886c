// Host Slot Broker Module
// Arbitrates a fixed pool of remote host slots among competing clients

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod slot_task;
pub mod table;

// Re-export key types
pub use client::{unique_client_id, BrokerClient};
pub use error::{BrokerError, BrokerResult};
pub use protocol::{BrokerEndpoint, ClientId, Grant};
pub use server::Broker;
pub use slot_task::SlotTask;
pub use table::{parse_hosts, HostSlots, SlotSnapshot, SlotTable, Transition};
