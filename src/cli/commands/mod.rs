use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ArgAction, ColorChoice, Command,
};

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("wgbroker")
        .about("Session and credential broker for Warpgate SSH gateways")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .help("Gateway base URL, example: https://gateway.tld:8888")
                .env("WGBROKER_URL")
                .required(true),
        )
        .arg(
            Arg::new("username")
                .short('U')
                .long("username")
                .help("Gateway username")
                .env("WGBROKER_USERNAME")
                .required(true),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .help("Gateway password")
                .env("WGBROKER_PASSWORD"),
        )
        .arg(
            Arg::new("otp-secret")
                .long("otp-secret")
                .help("Base32 TOTP secret for automatic one-time codes")
                .env("WGBROKER_OTP_SECRET"),
        )
        .arg(
            Arg::new("trust-self-signed")
                .long("trust-self-signed")
                .help("Skip TLS certificate verification for this gateway")
                .env("WGBROKER_TRUST_SELF_SIGNED")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ticket")
                .short('t')
                .long("ticket")
                .help("Issue a one-time ticket for this target instead of listing targets")
                .value_name("TARGET"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("WGBROKER_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}
