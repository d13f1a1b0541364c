#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self
)]

//! Outbound delivery of long-form text to Lark / Feishu chats.
//!
//! Short replies go out as one message. Long replies are published as Drive
//! documents in a per-chat folder and announced with a link, or split into
//! `[i/N]` chunks when publishing is not possible. While the long connection
//! is down, deliveries wait in an in-memory queue.

pub mod channels;
pub mod config;
pub mod delivery;
pub mod util;

pub use channels::LarkChannel;
pub use config::Config;
pub use delivery::{Outbox, SendStatus};
