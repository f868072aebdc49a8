//! Alert delivery for suspicious sign-ins.
//!
//! This crate provides:
//! - `Notifier` trait for pluggable notification channels
//! - Graph `sendMail` and SMTP email notifier implementations
//! - Minijinja template rendering for alert subject and body

pub mod email;
pub mod graph_mail;
pub mod templating;
pub mod traits;

pub use email::EmailNotifier;
pub use graph_mail::GraphMailNotifier;
pub use templating::{AlertContext, AlertTemplates, EventLine};
pub use traits::{Notification, Notifier, SendError};
