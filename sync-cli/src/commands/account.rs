//! Account lifecycle commands.

use anyhow::{Context, Result};
use sync_client::AccountProfile;
use sync_types::RecordUuid;

use crate::config::{App, Workspace};

/// Log in to a new account, or to `uuid` when given.
pub async fn login(
    workspace: &Workspace,
    name: &str,
    email: Option<String>,
    uuid: Option<&str>,
) -> Result<()> {
    let uuid = match uuid {
        Some(raw) => raw.parse::<RecordUuid>().context("Invalid account uuid")?,
        None => RecordUuid::new(),
    };
    let app = App::open(workspace).await?;
    app.client
        .login(AccountProfile {
            uuid,
            name: name.to_string(),
            email,
        })
        .await?;

    println!("Logged in as {} ({})", name, uuid);
    Ok(())
}

/// Log out of the current account.
pub async fn logout(workspace: &Workspace) -> Result<()> {
    let app = App::open(workspace).await?;
    let user = app.client.current_user().await?;
    app.client.logout().await?;

    println!("Logged out of {}", user.entity.name);
    Ok(())
}

/// Turn private mode on or off.
pub async fn private_mode(workspace: &Workspace, enabled: bool) -> Result<()> {
    let app = App::open(workspace).await?;
    app.client.set_private_mode(enabled).await?;

    println!("Private mode {}", if enabled { "on" } else { "off" });
    Ok(())
}
