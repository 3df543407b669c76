//! Wire format and message construction.
//!
//! Every frame on the wire is `STARTING_SEQUENCE` (4 magic bytes) +
//! command (12-byte zero-padded ASCII tag) + payload length (u32 LE) +
//! payload, where the last payload byte is a control-flag sentinel.

pub mod broadcast;
pub mod commands;
pub mod factory;
pub mod header;
pub mod payloads;

pub use broadcast::BroadcastPreview;
pub use commands::MessageCommand;
pub use factory::MessageFactory;
pub use header::{peek_hello_version, HeaderPreview};
pub use payloads::{
    AckPayload, BroadcastPayload, DisconnectPayload, HelloPayload, Message, PingPayload,
    PongPayload, TxPayload,
};
