pub mod database;
pub mod models;

pub use database::{Database, UserDataStore};
pub use models::SettingKey;
