//! Mail responder — polls a mailbox for tagged messages and answers them
//! with text from a completion service.

pub mod completion;
pub mod config;
pub mod decoder;
pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod reply;
pub mod scheduler;
