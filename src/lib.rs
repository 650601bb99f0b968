pub mod broker;
pub mod cli;
pub mod gateway;
pub mod otp;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
