pub mod client;
pub mod error;
pub mod types;

pub use self::client::{ApiClient, SESSION_COOKIE_NAME};
pub use self::error::{ApiError, ApiResult};
