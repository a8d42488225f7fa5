//! All endpoints that the API can handle

pub mod admin;
pub mod clearance;
pub mod devices;
pub mod info;
pub mod rfid;
pub mod students;
pub mod token;
pub mod users;
pub(crate) mod util;
