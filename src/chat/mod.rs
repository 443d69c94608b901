pub mod catchup;
pub mod engine;
pub mod roles;
pub mod streaming_editor;
