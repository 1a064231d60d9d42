use thiserror::Error;

/// 呼び出し側が扱うエラーの大分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 入力が不正。再試行しても結果は変わらない
    Validation,
    /// 既に同じIPのルールが存在する
    Conflict,
    /// 対象のIPのルールが存在しない
    NotFound,
    /// ファイル/DBの障害。一時的な可能性がある
    Backend,
    /// ストアは更新済みだがディレクティブファイルが追従していない
    OutOfSync,
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("入力検証エラー: {0}")]
    Validation(String),

    #[error("IPルールは既に存在します: {0}")]
    AlreadyExists(String),

    #[error("IPルールが見つかりません: {0}")]
    NotFound(String),

    #[error("設定エラー: {0}")]
    Config(String),

    #[error("ファイル入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON解析エラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("データベースエラー: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("コネクションプールエラー: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("保存データが不正です: {0}")]
    InvalidData(String),

    /// `target` は単一のIPアドレス、または一括処理の対象 (追加種別、全件再生成など)
    #[error("ディレクティブファイルの同期に失敗しました (対象: {target}): {source}")]
    DirectiveSync {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuleError::Validation(_) | RuleError::Config(_) => ErrorKind::Validation,
            RuleError::AlreadyExists(_) => ErrorKind::Conflict,
            RuleError::NotFound(_) => ErrorKind::NotFound,
            RuleError::Io(_)
            | RuleError::Json(_)
            | RuleError::Database(_)
            | RuleError::Pool(_)
            | RuleError::InvalidData(_) => ErrorKind::Backend,
            RuleError::DirectiveSync { .. } => ErrorKind::OutOfSync,
        }
    }

    /// バックエンド障害のみ呼び出し側での再試行に意味がある
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Backend
    }
}

pub type RuleResult<T> = Result<T, RuleError>;
