use std::env;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{dispatcher, info, warn, Dispatch};
use tracing_subscriber::EnvFilter;

use auto_notary::batch::BatchRunner;
use auto_notary::config::{Cli, Command, RunConfig};
use auto_notary::grant::GrantRequestBuilder;
use auto_notary::ledger::{lotus::API_INFO_ENV, ApiInfo, GrantSubmitter, LotusClient};
use auto_notary::row::RowProcessor;
use auto_notary::sheet::{credentials::ACCESS_TOKEN_ENV, Credentials, SheetsClient, Worksheet};

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .finish();
    let dispatch = Dispatch::new(subscriber);

    let cli = Cli::parse();
    dispatcher::with_default(&dispatch, || -> Result<()> {
        match cli.command {
            Command::Run(args) => {
                let config = RunConfig::from_args(&cli.repo, args)?;
                run(config, dispatch.clone())
            }
        }
    })
}

fn run(config: RunConfig, dispatch: Dispatch) -> Result<()> {
    info!(
        from = %config.operator,
        spreadsheet = %config.spreadsheet_id,
        range = %config.layout.read_range(),
        "starting auto-notary"
    );

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(config.http_timeout)
        .timeout_read(config.http_timeout)
        .build();
    let credentials = Credentials::load(config.cred_file.as_deref(), env::var(ACCESS_TOKEN_ENV).ok())
        .context("loading sheet credentials")?;
    let token = credentials
        .access_token(&agent)
        .context("obtaining sheet access token")?;
    let store = SheetsClient::new(token, config.http_timeout).context("creating sheets client")?;
    let mut sheet = Worksheet::new(
        store,
        config.spreadsheet_id.clone(),
        config.layout.clone(),
        config.retry.clone(),
    );

    let rows = sheet.fetch_rows()?;
    if rows.is_empty() {
        println!("No data found.");
        return Ok(());
    }
    info!(rows = rows.len(), "fetched requests");

    let api_info = ApiInfo::discover(env::var(API_INFO_ENV).ok().as_deref(), &config.repo)
        .with_context(|| format!("locating node api (set {API_INFO_ENV} or --repo)"))?;
    if api_info.token.is_none() {
        warn!(url = %api_info.url, "no node token found, pushes will likely be refused");
    }
    let client = LotusClient::new(api_info, config.network, config.http_timeout);
    let processor = RowProcessor::new(
        GrantRequestBuilder::new(config.operator.clone()),
        GrantSubmitter::new(client, config.retry.clone()),
        config.policy,
    );

    let mut runner = BatchRunner::new(processor, sheet, dispatch);
    let summary = runner.run(rows)?;
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some requests were not granted, see the outcome column");
    }
    Ok(())
}
