pub mod discovery;
pub mod hello;
pub mod hello_rpc;
pub mod peer_events;
pub mod peer_id;
pub mod peer_table;
