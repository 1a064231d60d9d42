use crate::error::InitProcessError;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    List { page: usize, filter: String },
    Add { ip: String, action: String },
    Delete { ip: String },
    SetAction { ip: String, action: String },
    Clear { origin: String },
    Reconcile,
}

pub const USAGE: &str = "使い方: proxy-ip-rules <list [page] [filter] | add <ip> <allow|block> | delete <ip> | allow <ip> | block <ip> | clear <manual|automatic|malicious> | reconcile>";

impl Command {
    pub fn parse<I>(args: I) -> Result<Self, InitProcessError>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        let arg = |index: usize| {
            args.get(index)
                .cloned()
                .ok_or_else(|| InitProcessError::CommandParseError(USAGE.to_string()))
        };

        match args.first().map(String::as_str) {
            None | Some("list") => {
                let page = match args.get(1) {
                    Some(raw) => raw
                        .parse()
                        .map_err(|e| InitProcessError::CommandParseError(format!("無効なページ番号 {}: {}", raw, e)))?,
                    None => 1,
                };
                let filter = args.get(2).cloned().unwrap_or_else(|| "all".to_string());
                Ok(Command::List { page, filter })
            }
            Some("add") => Ok(Command::Add {
                ip: arg(1)?,
                action: arg(2)?,
            }),
            Some("delete") => Ok(Command::Delete { ip: arg(1)? }),
            Some(action @ ("allow" | "block")) => Ok(Command::SetAction {
                ip: arg(1)?,
                action: action.to_string(),
            }),
            Some("clear") => Ok(Command::Clear { origin: arg(1)? }),
            Some("reconcile") => Ok(Command::Reconcile),
            Some(other) => Err(InitProcessError::CommandParseError(format!("不明なコマンド {}。{}", other, USAGE))),
        }
    }
}
