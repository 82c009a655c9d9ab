//! Image CLI commands.

use clap::Args;

use crate::config::Config;
use crate::engine::RegistryAuth;

/// Registry and credentials for pull and push.
#[derive(Args, Debug, Clone, Default)]
pub struct RegistryArgs {
    /// Registry to use when the image name has none
    #[arg(long)]
    pub registry: Option<String>,

    #[arg(long, env = "DOCKHAND_REGISTRY_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "DOCKHAND_REGISTRY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Identity token, used instead of username and password
    #[arg(long, env = "DOCKHAND_REGISTRY_TOKEN", hide_env_values = true)]
    pub identity_token: Option<String>,
}

impl RegistryArgs {
    pub fn auth(&self) -> Option<RegistryAuth> {
        if let Some(token) = &self.identity_token {
            return Some(RegistryAuth::token(token));
        }
        let username = self.username.as_deref()?;
        let mut auth = RegistryAuth::basic(username, self.password.as_deref().unwrap_or_default());
        auth.serveraddress = self.registry.clone();
        Some(auth)
    }
}

pub async fn run_pull_command(
    config: &Config,
    image: &str,
    registry: &RegistryArgs,
) -> anyhow::Result<()> {
    let client = super::connect(config).await?;
    let auth = registry.auth();
    client
        .pull_image(image, registry.registry.as_deref(), auth.as_ref())
        .await?;
    println!("Pulled {}", image);
    Ok(())
}

pub async fn run_push_command(
    config: &Config,
    image: &str,
    registry: &RegistryArgs,
) -> anyhow::Result<()> {
    let client = super::connect(config).await?;
    let auth = registry.auth();
    client
        .push_image(image, registry.registry.as_deref(), auth.as_ref())
        .await?;
    println!("Pushed {}", image);
    Ok(())
}
