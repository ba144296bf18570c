pub mod config;
pub mod discovery;
pub mod fetch;
pub mod net;
pub mod node;
pub mod util;
