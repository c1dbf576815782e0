pub mod models;
pub mod recognizer;
