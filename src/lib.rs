pub mod advice;
pub mod config;
pub mod gemini;
pub mod line;
pub mod matching;
pub mod models;
pub mod photo;
pub mod records;
pub mod reminders;
pub mod server;
pub mod supabase;

pub use config::AppConfig;
pub use server::{build_router, run_server, AppState};
