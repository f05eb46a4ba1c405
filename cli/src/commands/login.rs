//! `strata login` command - Store registry credentials.

use clap::Args;
use strata_core::StrataConfig;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

fn prompt(label: &str) -> Result<String, Box<dyn std::error::Error>> {
    if !label.is_empty() {
        eprint!("{label}: ");
    }
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub async fn execute(args: LoginArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "docker.io".to_string());

    let username = match args.username {
        Some(u) => u,
        None => prompt("Username")?,
    };

    let password = if args.password_stdin {
        prompt("")?
    } else {
        match args.password {
            Some(p) => p,
            None => prompt("Password")?,
        }
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = super::credential_store(config)?;
    store.store(&server, &username, &password)?;

    println!("Login Succeeded");
    Ok(())
}
