pub mod attachments;
pub mod body;
pub mod connection;
pub mod dispatch;
pub mod mailbox;
pub mod message;
pub mod orchestrator;
pub mod spam;

pub use dispatch::DispatchOutcome;
