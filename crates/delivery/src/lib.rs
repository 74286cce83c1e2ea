//! Delivery pipeline: pending messages are claimed, optionally merged by
//! conversation, routed to a platform, and any reply is sent back through
//! the serialised [`MessageSender`].

pub mod error;
pub mod merge;
pub mod sender;
pub mod service;

pub use {
    error::{Error, Result},
    merge::{DeliveryUnit, group_units},
    sender::{MessageSender, SendRequest, SendResult},
    service::{DeliveryOutcome, DeliveryPipeline},
};
