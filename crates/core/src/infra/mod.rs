pub mod capture;
pub mod completion;
pub mod metrics;
pub mod stt;
pub mod tts;
pub mod worker;
