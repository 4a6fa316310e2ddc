pub mod client_management;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod messaging;
pub mod session_management;
pub mod storage;
pub mod web_interface;
