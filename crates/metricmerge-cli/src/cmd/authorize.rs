//! `metricmerge authorize`: offline OAuth code flow for a refresh token.

use std::io::{self, BufRead, Write};

use anyhow::{Context as _, Result};
use clap::Args;
use metricmerge_core::config::AppConfig;

use crate::dropbox::auth::{authorize_url, exchange_code};
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct AuthorizeArgs {
    /// Authorization code, if already obtained. Prompted for otherwise.
    #[arg(long)]
    pub code: Option<String>,
}

fn read_code(input: &mut dyn BufRead, prompt: &mut dyn Write, url: &str) -> Result<String> {
    writeln!(prompt, "1. Open this URL: {url}")?;
    writeln!(prompt, "2. Click \"Allow\"")?;
    write!(prompt, "3. Paste the authorization code here: ")?;
    prompt.flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("reading authorization code")?;
    let code = line.trim().to_string();
    anyhow::ensure!(!code.is_empty(), "no authorization code entered");
    Ok(code)
}

pub fn run_authorize(args: &AuthorizeArgs, config: &AppConfig, mode: OutputMode) -> Result<()> {
    let remote = &config.remote;
    anyhow::ensure!(
        !remote.app_key.is_empty() && !remote.app_secret.is_empty(),
        "DROPBOX_APP_KEY and DROPBOX_APP_SECRET must be set to authorize"
    );

    let code = match &args.code {
        Some(code) => code.clone(),
        None => {
            let url = authorize_url(&remote.app_key);
            read_code(&mut io::stdin().lock(), &mut io::stderr(), &url)?
        }
    };

    let tokens = exchange_code(&remote.app_key, &remote.app_secret, &code)
        .context("exchanging authorization code")?;
    render(mode, &tokens, |tokens, w| {
        writeln!(w, "Refresh token: {}", tokens.refresh_token)?;
        writeln!(w, "Set it as DROPBOX_REFRESH_TOKEN or remote.refresh_token.")
    })
}
