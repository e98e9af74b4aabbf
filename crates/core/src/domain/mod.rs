pub mod error;
pub mod event;
pub mod session;
pub mod settings;
pub mod stt;
pub mod types;
pub mod worker;
