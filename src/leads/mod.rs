//! Lead records and the pipeline state machine.

pub mod model;
pub mod state;

pub use model::{
    Activity, ActivityKind, Appointment, AppointmentStatus, ChannelKind, Communication, Consent,
    Direction, Lead, ReminderSlot, ScheduledKind, ScheduledMessage,
};
pub use state::{LeadStatus, StatusTransition};
