//! Local storage

pub mod layout;
pub mod license;
pub mod settings;
