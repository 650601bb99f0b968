use anyhow::Result;
use wgbroker::cli::{actions, actions::Action, start};

// Main function
#[tokio::main]
async fn main() -> Result<()> {
    // Start the program
    let action = start()?;

    // Handle the action
    match action {
        Action::Connect { .. } => actions::connect::handle(action).await?,
    }

    Ok(())
}
