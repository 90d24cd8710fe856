//! Activity logging: JSONL append-only writer fed by a non-blocking channel.

pub mod activity;
pub mod jsonl;
