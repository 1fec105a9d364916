use clap::Parser;

/// Local Cognito-compatible OAuth2/OIDC identity provider
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Listen port (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen host (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Issuer URL (overrides config file)
    #[arg(long)]
    pub issuer: Option<String>,
}
