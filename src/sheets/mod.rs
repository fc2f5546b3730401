//! Google Sheets destination: service account auth and full-sheet replace.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::{AccessToken, ServiceAccountKey};
pub use client::{GoogleSheetsClient, SheetsSession, DEFAULT_API_BASE};
pub use types::SheetsError;
