//! fwctl Library
//!
//! Remote upgrade and transfer orchestration for embedded imaging devices.

pub mod app;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod upgrade;
pub mod utils;
