pub mod fake_server;
pub mod polling;
