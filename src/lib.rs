//! Lead Cadence: an engagement scheduler that decides when and how to
//! follow up with mortgage leads.

pub mod agent;
pub mod cadence;
pub mod channels;
pub mod config;
pub mod crm;
pub mod error;
pub mod leads;
pub mod llm;
pub mod safety;
pub mod store;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
pub mod webhooks;
