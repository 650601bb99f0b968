pub mod connect;

#[derive(Debug)]
pub enum Action {
    Connect {
        url: String,
        username: String,
        password: Option<String>,
        otp_secret: Option<String>,
        trust_self_signed: bool,
        ticket_target: Option<String>,
    },
}
