pub mod system;
pub mod transcribe;
