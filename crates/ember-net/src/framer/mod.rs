pub mod delimited;
pub mod length_prefixed;
pub mod websocket;
