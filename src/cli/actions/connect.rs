use crate::broker::config::{ConfigStore, MemoryConfigStore, NewServer};
use crate::broker::{Broker, OtpPrompter, TracingNotifier};
use crate::cli::actions::Action;
use crate::gateway::client::ssh_connection_string;
use crate::otp;
use anyhow::{anyhow, bail, Result};
use secrecy::SecretString;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use url::Url;

/// Prompts for a one-time code on the controlling terminal.
struct StdinOtpPrompter;

impl OtpPrompter for StdinOtpPrompter {
    fn prompt(&self, server_name: &str) -> Option<String> {
        eprint!("One-time code for {server_name}: ");
        let _ = io::stderr().flush();

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;

        let code = line.trim().to_string();
        (!code.is_empty()).then_some(code)
    }
}

/// Handle the connect action
pub async fn handle(action: Action) -> Result<()> {
    let Action::Connect {
        url,
        username,
        password,
        otp_secret,
        trust_self_signed,
        ticket_target,
    } = action;

    let name = Url::parse(&crate::gateway::client::normalize_base_url(&url))
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.clone());

    let store = Arc::new(MemoryConfigStore::new());
    let broker = Broker::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::new(TracingNotifier),
        Arc::new(StdinOtpPrompter),
    );

    let server = broker.add_server(NewServer {
        name,
        url,
        username,
        password: password.map(SecretString::from),
        trust_self_signed: trust_self_signed.then_some(true),
        otp_secret: otp_secret.map(SecretString::from),
    })?;

    let outcome = broker.connect(&server.id).await?;
    if !outcome.success {
        let reason = outcome
            .error
            .unwrap_or_else(|| "Authentication failed".to_string());
        broker.destroy().await;
        bail!(reason);
    }

    if let Some(target_name) = ticket_target {
        let details = broker.get_or_create_ticket(&server.id, &target_name).await?;
        println!("{}@{}:{}", details.username, details.host, details.port);
        broker.invalidate_ticket(&server.id, &target_name);
    } else {
        let status = broker
            .status(&server.id)
            .ok_or_else(|| anyhow!("No status for {}", server.name))?;

        for target in status
            .targets
            .iter()
            .filter(|target| target.kind == crate::gateway::types::TargetKind::Ssh)
        {
            let details = broker.get_ssh_connection_details(&server.id, &target.name)?;
            println!(
                "{}",
                ssh_connection_string(&target.name, &server.username, &details.host, details.port)
            );
        }

        if broker.has_otp_secret(&server.id) {
            eprintln!(
                "Current one-time code valid for {}s",
                otp::remaining_seconds(otp::DEFAULT_PERIOD)
            );
        }
    }

    broker.destroy().await;

    Ok(())
}
