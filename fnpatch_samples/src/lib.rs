//! サンプル共通のヘルパー

use fnpatch_rewriter::{arch::PATCHABLE_ADD, CodePage, PatchError};
use log::LevelFilter;
use std::error::Error;

/// ログレベルを指定する環境変数
pub const LOG_LEVEL_ENV: &str = "FNPATCH_LOG";

/// デモ用の`add`のシグネチャ
pub type AddFn = extern "C" fn(i32, i32) -> i32;

/// コンソールへ出力するロガーを設定する
pub fn init_logger() -> Result<(), Box<dyn Error>> {
    const PATTERN: &str = "{d(%H:%M:%S%.3f)} [{h({l})}] {M} - {m}{n}";

    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    let stdout = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(PATTERN)))
        .build();
    let root = log4rs::config::Root::builder()
        .appender("stderr")
        .build(level);
    let config = log4rs::Config::builder()
        .appender(log4rs::config::Appender::builder().build("stderr", Box::new(stdout)))
        .build(root)?;
    log4rs::init_config(config)?;
    Ok(())
}

/// 書き換え可能な`add`を実行可能ページに置く
///
/// 戻り値のページを保持している間だけ関数として呼べる。
pub fn map_add() -> Result<(CodePage, AddFn), PatchError> {
    let page = CodePage::with_code(PATCHABLE_ADD)?;
    let add: AddFn = unsafe { std::mem::transmute(page.address()) };
    Ok((page, add))
}
