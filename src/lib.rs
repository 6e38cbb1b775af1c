pub mod audit;
pub mod bol;
pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod outbox;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;

pub use bol::{BillOfLading, BolDraft, CargoItem, FreightCharges, Party, TimeStamp};
pub use error::{ValidationError, WorkflowError};
pub use service::{Actor, BolService, StatusUpdate};
pub use status::{BolStatus, Role, TransitionTable};
