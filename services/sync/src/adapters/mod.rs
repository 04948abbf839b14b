pub mod db;
pub mod scrape;
pub mod session_file;
pub mod webhook;

pub use db::DbAdapter;
pub use scrape::HttpScrapeAdapter;
pub use session_file::FileSessionAdapter;
pub use webhook::{WebhookHub, WebhookPayload};
