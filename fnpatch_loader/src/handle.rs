use log::{debug, warn};
use std::ffi::{c_void, CStr};
use std::ptr::NonNull;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
use libc::{c_int, Dl_info};

// glibcの拡張。<dlfcn.h>の値
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const RTLD_DI_LINKMAP: c_int = 2;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const RTLD_DL_LINKMAP: c_int = 2;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
    fn dladdr1(
        addr: *const c_void,
        info: *mut Dl_info,
        extra_info: *mut *mut c_void,
        flags: c_int,
    ) -> c_int;
}

/// `dlopen`で得たライブラリ参照
///
/// Dropで一度だけ`dlclose`する。`detached`なハンドルは何も所有しない。
#[derive(Debug)]
pub struct LibraryHandle {
    raw: Option<NonNull<c_void>>,
    name: String,
}

// dlopenのハンドルはプロセス全体で有効
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

impl LibraryHandle {
    /// # Safety
    /// `raw`は`dlopen`が返した、まだ閉じていないハンドルであること。
    pub(crate) unsafe fn from_raw(raw: NonNull<c_void>, name: impl Into<String>) -> Self {
        Self {
            raw: Some(raw),
            name: name.into(),
        }
    }

    /// 何も所有しないハンドル
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            raw: None,
            name: name.into(),
        }
    }

    /// 開くときに指定した名前
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 何も所有していないか
    pub fn is_detached(&self) -> bool {
        self.raw.is_none()
    }

    pub(crate) fn as_ptr(&self) -> *mut c_void {
        self.raw.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// `address`を定義しているのが別のオブジェクトなら、そのパスを返す
    ///
    /// `dlsym`はハンドルの依存ライブラリまで探すため、見つかったシンボルが
    /// このライブラリ自身のものかをリンクマップで確かめる。判定できないときは`None`。
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub(crate) fn foreign_owner(&self, address: usize) -> Option<String> {
        let raw = self.raw?;

        let mut own_map: *mut c_void = std::ptr::null_mut();
        let rc = unsafe {
            dlinfo(
                raw.as_ptr(),
                RTLD_DI_LINKMAP,
                &mut own_map as *mut *mut c_void as *mut c_void,
            )
        };
        if rc != 0 || own_map.is_null() {
            debug!("dlinfo({}) failed: {}", self.name, last_dl_error());
            return None;
        }

        let mut info: Dl_info = unsafe { std::mem::zeroed() };
        let mut owner_map: *mut c_void = std::ptr::null_mut();
        let found = unsafe {
            dladdr1(address as *const c_void, &mut info, &mut owner_map, RTLD_DL_LINKMAP)
        };
        if found == 0 || owner_map.is_null() {
            debug!("no object contains {:#x}", address);
            return None;
        }
        if owner_map == own_map {
            return None;
        }

        if info.dli_fname.is_null() {
            Some(format!("object at {:#x}", info.dli_fbase as usize))
        } else {
            Some(unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned())
        }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub(crate) fn foreign_owner(&self, _address: usize) -> Option<String> {
        None
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if unsafe { libc::dlclose(raw.as_ptr()) } != 0 {
                warn!("dlclose({}) failed: {}", self.name, last_dl_error());
            } else {
                debug!("released {}", self.name);
            }
        }
    }
}

/// 直近の`dlerror`メッセージ
pub(crate) fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}
