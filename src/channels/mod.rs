//! Messaging channel integrations.
//!
//! A channel implements the [`Channel`] trait defined in [`traits`]: sending a
//! single message, listening for inbound messages, health checking and typing
//! indicators. [`LarkChannel`] is the Lark/Feishu implementation and also
//! provides the REST transport and session used by [`crate::delivery`].

pub mod lark;
pub mod traits;

pub use lark::LarkChannel;
pub use traits::{Channel, ChannelMessage, SendMessage};
