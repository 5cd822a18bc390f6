//! The records passed between callers, plugins and provider adapters.
//!
//! A [`conversation::Conversation`] owns an ordered list of
//! [`message::Message`]s. Adapters translate that list into each vendor's wire
//! format and hand back a new assistant message; no vendor shape leaks into
//! these types except the opaque `raw` response kept for inspection.
pub mod conversation;
pub mod message;
pub mod objectid;
