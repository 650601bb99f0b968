use crate::cli::actions::Action;
use anyhow::Result;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Connect {
        url: matches
            .get_one("url")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --url"))?,
        username: matches
            .get_one("username")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --username"))?,
        password: matches.get_one::<String>("password").cloned(),
        otp_secret: matches.get_one::<String>("otp-secret").cloned(),
        trust_self_signed: matches.get_flag("trust-self-signed"),
        ticket_target: matches.get_one::<String>("ticket").cloned(),
    })
}
