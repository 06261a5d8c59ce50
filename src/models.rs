pub mod network;
pub mod users;
