use proxy_ip_rules::RuleError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitProcessError {
    #[error("ロガーのセットアップに失敗しました: {0}")]
    LoggerError(String),

    #[error("設定の読み込みに失敗しました: {0}")]
    ConfigError(String),

    #[error("ルールストアの初期化に失敗しました: {0}")]
    StoreInitError(String),

    #[error("コマンドの解析に失敗しました: {0}")]
    CommandParseError(String),

    #[error("コマンドの実行に失敗しました: {0}")]
    CommandError(#[from] RuleError),

    #[error("出力の生成に失敗しました: {0}")]
    OutputError(#[from] serde_json::Error),
}
