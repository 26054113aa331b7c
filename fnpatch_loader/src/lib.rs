//! シンボル解決
//!
//! ライブラリ名と関数名から、実行中のプロセス内のアドレスを求める。
//! 解決そのものは副作用のない検索で、取得したライブラリの参照は
//! `LibraryHandle`のDropで手放す。

mod config;
mod error;
mod handle;
mod resolver;

pub use config::ResolverConfig;
pub use error::ResolveError;
pub use handle::LibraryHandle;
pub use resolver::{DlResolver, ResolvedSymbol, StaticResolver, SymbolResolver};
