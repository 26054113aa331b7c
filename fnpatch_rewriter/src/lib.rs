pub mod arch;
mod code_page;
mod error;
mod maps;
mod patcher;
mod protect;
mod slot;

pub use code_page::CodePage;
pub use error::PatchError;
pub use maps::{find_region, parse_maps, parse_proc_maps, MemoryRegion};
pub use patcher::{CodePatcher, NativePatcher, PatchRecord};
pub use protect::PageRange;
pub use slot::OriginalSlot;
