pub mod backend;
pub mod envelope;
pub mod fetcher;
pub mod handler;
pub mod pending;
pub mod tcp_backend;
pub mod udp;
