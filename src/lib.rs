pub mod api;
pub mod configs;
pub mod distributed;
pub mod error;
pub mod process;
pub mod server;
pub mod supervisor;
