//! Customer-support messaging core: room lifecycle, message log, escalation,
//! agent roster and per-agent unread tracking, served over HTTP and WebSocket.

pub mod app;
pub mod assistant;
pub mod config;
pub mod error;
pub mod escalation;
pub mod faq;
pub mod llm;
pub mod locale;
pub mod message_log;
pub mod notify;
pub mod presence;
pub mod profile;
pub mod prompting;
pub mod roster;
pub mod session;
pub mod staff;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;
