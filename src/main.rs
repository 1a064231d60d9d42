use log::{error, info};

mod command;
mod error;

use crate::command::Command;
use crate::error::InitProcessError;
use proxy_ip_rules::setup_logger::setup_logger;
use proxy_ip_rules::{Configuration, RuleService};

#[tokio::main]
async fn main() -> Result<(), InitProcessError> {
    let config = Configuration::from_env().map_err(|e| InitProcessError::ConfigError(e.to_string()))?;

    setup_logger(&config.log).map_err(|e| InitProcessError::LoggerError(e.to_string()))?;

    let command = Command::parse(std::env::args().skip(1))?;

    // ルールストアとディレクティブファイルの準備
    let service = RuleService::open(&config)
        .await
        .map_err(|e| InitProcessError::StoreInitError(e.to_string()))?;
    info!(
        "ルールストアを開きました: {} / {:?}",
        service.repository().backend_name(),
        service.directive().path()
    );

    if let Err(e) = run(&service, command).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(service: &RuleService, command: Command) -> Result<(), InitProcessError> {
    match command {
        Command::List { page, filter } => {
            let result = service.list(page, &filter).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Add { ip, action } => {
            let rule = service.add(&ip, &action).await?;
            println!("IPルールを追加しました: {}", rule.directive_line());
        }
        Command::Delete { ip } => {
            service.delete(&ip).await?;
            println!("IPルールを削除しました: {}", ip);
        }
        Command::SetAction { ip, action } => {
            let rule = service.set_action(&ip, &action).await?;
            println!("IPルールを更新しました: {}", rule.directive_line());
        }
        Command::Clear { origin } => {
            let removed = service.clear(&origin).await?;
            println!("{} のIPルールを{}件削除しました", origin, removed);
        }
        Command::Reconcile => {
            let count = service.reconcile().await?;
            println!("ディレクティブファイルを{}件のルールから再生成しました", count);
        }
    }
    Ok(())
}
