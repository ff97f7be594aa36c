pub mod auth;
pub mod cipher;
pub mod client_packets;
pub mod frame;
pub mod opcodes;
pub mod packet;
pub mod registry;
pub mod selector;
pub mod server_packets;
pub mod session;
pub mod throttle;
pub mod trace;
