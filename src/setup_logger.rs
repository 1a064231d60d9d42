use env_logger::{Builder, Target};
use std::fs::OpenOptions;
use std::io::Write;

use crate::core::config::LogConfig;

pub fn setup_logger(config: &LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = Builder::new();

    builder
        // ログレベルの設定
        .filter_level(config.level)
        // タイムスタンプ付きのフォーマット
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    // ファイル指定があればファイルに、無ければ標準出力に出す
    match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stdout);
        }
    }

    builder.try_init()?;
    Ok(())
}
