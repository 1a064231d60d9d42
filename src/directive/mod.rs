//! プロキシのアクセス制御モジュールが直接読む `allow <ip>;` / `deny <ip>;` 形式のファイル。
//!
//! ストアから導出される射影であり、1アドレスにつき1行だけを保つ。
//! このモジュールが書かない行 (手で追記された行など) は、削除対象の
//! アドレスと完全一致するトークンを含まない限りそのまま残す。

use log::debug;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::storage::atomic_write::{atomic_write, ensure_parent_dir};
use crate::storage::models::rule::{RuleAction, RuleRecord};

#[derive(Debug, Clone)]
pub struct DirectiveFile {
    path: PathBuf,
}

pub fn format_line(ip: &str, action: RuleAction) -> String {
    format!("{} {};", action.directive_keyword(), ip)
}

/// 行がアドレスを独立したトークンとして含むか (10.0.0.1 と 10.0.0.12 を区別する)
pub fn line_targets(line: &str, ip: &str) -> bool {
    line.split(|c: char| c.is_whitespace() || c == ';')
        .any(|token| token == ip)
}

impl DirectiveFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_exists(&self) -> io::Result<()> {
        ensure_parent_dir(&self.path).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }

    pub async fn read_lines(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn append_line(&self, ip: &str, action: RuleAction) -> io::Result<()> {
        self.ensure_exists().await?;
        let mut line = format_line(ip, action);
        line.push('\n');
        // 手で編集されて最終行に改行が無い場合、その行に連結しない
        let existing = fs::read(&self.path).await?;
        if existing.last().is_some_and(|byte| *byte != b'\n') {
            line.insert(0, '\n');
        }

        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        debug!("ディレクティブを追記しました: {}", format_line(ip, action));
        Ok(())
    }

    /// アドレスを含む行をすべて削除する。削除があったかを返す
    pub async fn remove_line(&self, ip: &str) -> io::Result<bool> {
        let mut targets = HashSet::new();
        targets.insert(ip.to_string());
        Ok(self.remove_lines(&targets).await? > 0)
    }

    pub async fn remove_lines(&self, ips: &HashSet<String>) -> io::Result<usize> {
        if ips.is_empty() || fs::metadata(&self.path).await.is_err() {
            return Ok(0);
        }

        let lines = self.read_lines().await?;
        let kept: Vec<&String> = lines
            .iter()
            .filter(|line| !ips.iter().any(|ip| line_targets(line, ip)))
            .collect();

        let removed = lines.len() - kept.len();
        if removed > 0 {
            self.write_lines(kept).await?;
            debug!("ディレクティブを{}行削除しました", removed);
        }
        Ok(removed)
    }

    /// 古い行を消してから新しいアクションの行を追記する
    pub async fn replace_line(&self, ip: &str, action: RuleAction) -> io::Result<()> {
        self.remove_line(ip).await?;
        self.append_line(ip, action).await
    }

    /// ストアの内容からファイルを作り直す。どのルールにも該当しない行は残す
    pub async fn rewrite_all(&self, rules: &[RuleRecord]) -> io::Result<()> {
        ensure_parent_dir(&self.path).await?;

        let lines = self.read_lines().await?;
        let foreign = lines.iter().filter(|line| {
            !line.trim().is_empty() && !rules.iter().any(|rule| line_targets(line, &rule.ip_address))
        });

        let generated: Vec<String> = rules.iter().map(RuleRecord::directive_line).collect();
        self.write_lines(foreign.chain(generated.iter())).await
    }

    async fn write_lines<'a, I>(&self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        atomic_write(&self.path, content.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::rule::OriginType;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(id: i64, ip: &str, action: RuleAction) -> RuleRecord {
        RuleRecord {
            id,
            ip_address: ip.to_string(),
            action,
            date_added: Utc::now(),
            origin_type: OriginType::Manual,
        }
    }

    #[test]
    fn test_line_targets_whole_token() {
        assert!(line_targets("deny 10.0.0.1;", "10.0.0.1"));
        assert!(line_targets("allow   10.0.0.1 ;", "10.0.0.1"));
        assert!(!line_targets("deny 10.0.0.12;", "10.0.0.1"));
        assert!(!line_targets("deny 110.0.0.1;", "10.0.0.1"));
        assert!(!line_targets("# comment", "10.0.0.1"));
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let file = DirectiveFile::new(dir.path().join("host_data").join("ips.conf"));

        file.append_line("203.0.113.5", RuleAction::Allow).await.unwrap();
        file.append_line("198.51.100.9", RuleAction::Block).await.unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "allow 203.0.113.5;\ndeny 198.51.100.9;\n");
    }

    #[tokio::test]
    async fn test_append_after_line_without_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ips.conf");
        std::fs::write(&path, "allow 172.16.0.1;").unwrap();
        let file = DirectiveFile::new(&path);

        file.append_line("10.0.0.1", RuleAction::Block).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "allow 172.16.0.1;\ndeny 10.0.0.1;\n");

        file.remove_line("10.0.0.1").await.unwrap();
        assert_eq!(file.read_lines().await.unwrap(), vec!["allow 172.16.0.1;".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_line_does_not_touch_overlapping_address() {
        let dir = tempdir().unwrap();
        let file = DirectiveFile::new(dir.path().join("ips.conf"));
        file.append_line("10.0.0.1", RuleAction::Block).await.unwrap();
        file.append_line("10.0.0.12", RuleAction::Block).await.unwrap();

        assert!(file.remove_line("10.0.0.1").await.unwrap());
        assert_eq!(file.read_lines().await.unwrap(), vec!["deny 10.0.0.12;".to_string()]);

        assert!(!file.remove_line("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_line_missing_file() {
        let dir = tempdir().unwrap();
        let file = DirectiveFile::new(dir.path().join("ips.conf"));
        assert!(!file.remove_line("10.0.0.1").await.unwrap());
        assert!(!file.path().exists());
    }

    #[tokio::test]
    async fn test_replace_line_keeps_single_line() {
        let dir = tempdir().unwrap();
        let file = DirectiveFile::new(dir.path().join("ips.conf"));
        file.append_line("192.168.1.10", RuleAction::Block).await.unwrap();
        file.replace_line("192.168.1.10", RuleAction::Allow).await.unwrap();

        assert_eq!(file.read_lines().await.unwrap(), vec!["allow 192.168.1.10;".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_lines_bulk() {
        let dir = tempdir().unwrap();
        let file = DirectiveFile::new(dir.path().join("ips.conf"));
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            file.append_line(ip, RuleAction::Block).await.unwrap();
        }
        let targets: HashSet<String> = ["10.0.0.1", "10.0.0.3"].iter().map(|s| s.to_string()).collect();

        assert_eq!(file.remove_lines(&targets).await.unwrap(), 2);
        assert_eq!(file.read_lines().await.unwrap(), vec!["deny 10.0.0.2;".to_string()]);
    }

    #[tokio::test]
    async fn test_rewrite_all_keeps_foreign_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ips.conf");
        std::fs::write(&path, "deny 10.0.0.1;\nallow 10.0.0.1;\n# added by hand\ndeny 172.16.0.1;\n").unwrap();

        let file = DirectiveFile::new(&path);
        file.rewrite_all(&[record(1, "10.0.0.1", RuleAction::Allow), record(2, "10.0.0.2", RuleAction::Block)])
            .await
            .unwrap();

        assert_eq!(
            file.read_lines().await.unwrap(),
            vec![
                "# added by hand".to_string(),
                "deny 172.16.0.1;".to_string(),
                "allow 10.0.0.1;".to_string(),
                "deny 10.0.0.2;".to_string(),
            ]
        );
    }
}
