use crate::config::{Contention, RegistryConfig};
use crate::error::HookError;
use crate::key::{HookKey, HookState};
use fnpatch_loader::{DlResolver, LibraryHandle, ResolverConfig, SymbolResolver};
use fnpatch_rewriter::{CodePatcher, NativePatcher, OriginalSlot, PatchError, PatchRecord};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// 導入済みのフック
///
/// Dropするとサンクとライブラリ参照が解放される。書き換えが残っている間は
/// Dropしてはいけない。
#[derive(Debug)]
struct HookEntry {
    record: PatchRecord,
    original: usize,
    slot: Option<&'static OriginalSlot>,
    // エントリと一緒に解放する
    _library: LibraryHandle,
}

#[derive(Debug)]
enum Slot {
    Installing,
    Installed(HookEntry),
    Uninstalling,
    Degraded(HookEntry, PatchError),
}

impl Slot {
    fn state(&self) -> HookState {
        match self {
            Slot::Installing => HookState::Installing,
            Slot::Installed(_) => HookState::Installed,
            Slot::Uninstalling => HookState::Uninstalling,
            Slot::Degraded(..) => HookState::Degraded,
        }
    }

    fn entry(&self) -> Option<&HookEntry> {
        match self {
            Slot::Installed(entry) | Slot::Degraded(entry, _) => Some(entry),
            Slot::Installing | Slot::Uninstalling => None,
        }
    }
}

/// `hooks()`が返すスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookStatus {
    /// 対象のキー
    pub key: HookKey,
    /// 取得時点の状態
    pub state: HookState,
    /// 書き換えたアドレス
    pub target: Option<usize>,
    /// 元関数の呼び出し先
    pub original: Option<usize>,
}

/// レジストリの統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// 書き換えに成功した回数
    pub patches_applied: u64,
    /// 書き戻しに成功した回数
    pub patches_reverted: u64,
    /// 導入に失敗した回数
    pub install_failures: u64,
    /// Degradedになった回数
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    patches_applied: AtomicU64,
    patches_reverted: AtomicU64,
    install_failures: AtomicU64,
    degraded: AtomicU64,
}

/// `install_all`に渡す1件分
#[derive(Debug, Clone)]
pub struct HookRequest {
    /// 対象のキー
    pub key: HookKey,
    /// 置き換え関数のアドレス
    pub replacement: usize,
    /// 元関数のアドレスを公開する先
    pub slot: Option<&'static OriginalSlot>,
}

impl HookRequest {
    /// 要求を作成
    pub fn new(library: impl Into<String>, symbol: impl Into<String>, replacement: usize) -> Self {
        Self {
            key: HookKey::new(library, symbol),
            replacement,
            slot: None,
        }
    }

    /// 元関数の公開先を指定
    pub fn with_slot(mut self, slot: &'static OriginalSlot) -> Self {
        self.slot = Some(slot);
        self
    }
}

/// プロセス内のフックを管理する
///
/// キーごとに高々1つのフックを持つ。状態遷移は`slots`のロックと`changed`で直列化し、
/// 実際のコード書き換えは`patched`のロックの下で1つずつ行う。
/// 1つのアドレスを書き換えるのは1つのキーだけ。
pub struct HookRegistry {
    resolver: Box<dyn SymbolResolver>,
    patcher: Box<dyn CodePatcher>,
    config: RegistryConfig,
    slots: Mutex<HashMap<HookKey, Slot>>,
    changed: Condvar,
    // 書き換え中のアドレスと、それを書き換えたキー
    patched: Mutex<HashMap<usize, HookKey>>,
    counters: Counters,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("config", &self.config)
            .field("slots", &self.lock_slots().len())
            .finish()
    }
}

/// 導入処理がパニックしたときに`Installing`を取り除く
struct InstallingGuard<'a> {
    registry: &'a HookRegistry,
    key: &'a HookKey,
}

impl Drop for InstallingGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.registry.lock_slots();
        if matches!(slots.get(self.key), Some(Slot::Installing)) {
            slots.remove(self.key);
        }
        self.registry.changed.notify_all();
    }
}

/// 書き戻しがパニックしたときに、エントリをDegradedとして戻す
///
/// 書き換えが残っているかもしれないので、サンクとライブラリ参照は解放しない。
struct UninstallingGuard<'a> {
    registry: &'a HookRegistry,
    key: &'a HookKey,
    entry: Option<HookEntry>,
}

impl UninstallingGuard<'_> {
    fn revert(&mut self) -> Result<(), PatchError> {
        match self.entry.as_mut() {
            Some(entry) => self.registry.revert_entry(entry),
            None => Ok(()),
        }
    }

    /// 書き戻しが戻ってきたらエントリを引き取る
    fn disarm(mut self) -> Option<HookEntry> {
        self.entry.take()
    }
}

impl Drop for UninstallingGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            error!("reverting {} panicked, keeping it degraded", self.key);
            self.registry.counters.degraded.fetch_add(1, Ordering::Relaxed);
            let reason = PatchError::UnsafeTarget {
                address: entry.record.target(),
                reason: "revert panicked".to_string(),
            };
            let mut slots = self.registry.lock_slots();
            slots.insert(self.key.clone(), Slot::Degraded(entry, reason));
            self.registry.changed.notify_all();
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// 動的ローダーとネイティブのパッチャーを使うレジストリ
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// 設定を指定して作成
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_parts(DlResolver::new(), NativePatcher::new(), config)
    }

    /// 環境変数（`FNPATCH_LIBRARY_PATH`, `FNPATCH_CONTENTION`）を反映したレジストリ
    pub fn from_env() -> Self {
        Self::with_parts(
            DlResolver::with_config(ResolverConfig::from_env()),
            NativePatcher::new(),
            RegistryConfig::from_env(),
        )
    }

    /// 解決と書き換えの実装を差し替えて作る
    pub fn with_parts(
        resolver: impl SymbolResolver + 'static,
        patcher: impl CodePatcher + 'static,
        config: RegistryConfig,
    ) -> Self {
        Self {
            resolver: Box::new(resolver),
            patcher: Box::new(patcher),
            config,
            slots: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            patched: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// 現在の設定
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// `library`の`symbol`を`replacement`に差し替え、元関数を呼ぶためのアドレスを返す
    ///
    /// 既に導入済みなら書き換えずに同じアドレスを返す。
    ///
    /// # Safety
    /// `replacement`は対象と同じシグネチャ・ABIの関数であること。置き換え関数は
    /// 複数スレッドから同時に呼ばれうる。
    pub unsafe fn install(
        &self,
        library: &str,
        symbol: &str,
        replacement: usize,
    ) -> Result<usize, HookError> {
        self.install_key(HookKey::new(library, symbol), replacement, None)
            .map(|(original, _)| original)
    }

    /// `install`に加え、元関数のアドレスを`slot`に公開する
    ///
    /// 公開はリダイレクトを書き込む前に行われる。
    ///
    /// # Safety
    /// `install`と同じ。
    pub unsafe fn install_with_slot(
        &self,
        library: &str,
        symbol: &str,
        replacement: usize,
        slot: &'static OriginalSlot,
    ) -> Result<usize, HookError> {
        self.install_key(HookKey::new(library, symbol), replacement, Some(slot))
            .map(|(original, _)| original)
    }

    /// 複数のフックをまとめて導入する
    ///
    /// 途中で失敗した場合、この呼び出しで新たに導入したものだけを解除して
    /// 最初のエラーを返す。元から導入済みだったフックには触れない。
    ///
    /// # Safety
    /// 各要求について`install`と同じ。
    pub unsafe fn install_all(&self, requests: &[HookRequest]) -> Result<Vec<usize>, HookError> {
        let mut originals = Vec::with_capacity(requests.len());
        let mut fresh = Vec::new();

        for request in requests {
            match self.install_key(request.key.clone(), request.replacement, request.slot) {
                Ok((original, newly_installed)) => {
                    originals.push(original);
                    if newly_installed {
                        fresh.push(request.key.clone());
                    }
                }
                Err(err) => {
                    warn!(
                        "installing {} failed, rolling back {} hook(s): {}",
                        request.key,
                        fresh.len(),
                        err
                    );
                    for key in fresh.iter().rev() {
                        if let Err(rollback) = self.uninstall_key(key) {
                            error!("rollback of {} failed: {}", key, rollback);
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(originals)
    }

    /// フックを解除する。導入されていなければ何もしない
    ///
    /// 戻った後は、`install`が返したアドレスを呼んではいけない。
    pub fn uninstall(&self, library: &str, symbol: &str) -> Result<(), HookError> {
        self.uninstall_key(&HookKey::new(library, symbol))
    }

    /// 対象が書き換わっているか（Installed または Degraded）
    pub fn is_hooked(&self, library: &str, symbol: &str) -> bool {
        self.state(library, symbol).is_hooked()
    }

    /// キーの現在の状態
    pub fn state(&self, library: &str, symbol: &str) -> HookState {
        self.lock_slots()
            .get(&HookKey::new(library, symbol))
            .map_or(HookState::Uninstalled, Slot::state)
    }

    /// 追跡中の全キーのスナップショット（キー順）
    pub fn hooks(&self) -> Vec<HookStatus> {
        let slots = self.lock_slots();
        let mut hooks: Vec<HookStatus> = slots
            .iter()
            .map(|(key, slot)| HookStatus {
                key: key.clone(),
                state: slot.state(),
                target: slot.entry().map(|entry| entry.record.target()),
                original: slot.entry().map(|entry| entry.original),
            })
            .collect();
        hooks.sort_by(|a, b| a.key.cmp(&b.key));
        hooks
    }

    /// 統計のスナップショット
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            patches_applied: self.counters.patches_applied.load(Ordering::Relaxed),
            patches_reverted: self.counters.patches_reverted.load(Ordering::Relaxed),
            install_failures: self.counters.install_failures.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    /// 全てのフックを解除する
    ///
    /// 解除できなかったものはDegradedのまま残り、最初のエラーを返す。
    pub fn shutdown(&self) -> Result<(), HookError> {
        let keys: Vec<HookKey> = self.lock_slots().keys().cloned().collect();
        let mut first_error = None;
        for key in keys {
            if let Err(err) = self.uninstall_key(&key) {
                error!("shutdown: {}", err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<HookKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_patched(&self) -> MutexGuard<'_, HashMap<usize, HookKey>> {
        self.patched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 進行中の遷移を待つ。fail-fastなら`InstallInProgress`
    fn wait_for_transition<'a>(
        &'a self,
        slots: MutexGuard<'a, HashMap<HookKey, Slot>>,
        key: &HookKey,
    ) -> Result<MutexGuard<'a, HashMap<HookKey, Slot>>, HookError> {
        match self.config.contention {
            Contention::FailFast => {
                warn!("{} is busy, failing fast", key);
                Err(HookError::InstallInProgress { key: key.clone() })
            }
            Contention::Block => {
                debug!("waiting for the pending transition of {}", key);
                Ok(self.changed.wait(slots).unwrap_or_else(|e| e.into_inner()))
            }
        }
    }

    /// 戻り値の`bool`はこの呼び出しで新たに導入したかどうか
    unsafe fn install_key(
        &self,
        key: HookKey,
        replacement: usize,
        slot: Option<&'static OriginalSlot>,
    ) -> Result<(usize, bool), HookError> {
        let mut slots = self.lock_slots();
        loop {
            match slots.get(&key) {
                None => break,
                Some(Slot::Installed(entry)) => {
                    if entry.record.replacement() != replacement {
                        warn!(
                            "{} is already hooked by {:#x}; keeping it instead of {:#x}",
                            key,
                            entry.record.replacement(),
                            replacement
                        );
                    }
                    if let Some(slot) = slot {
                        slot.publish(entry.original);
                    }
                    return Ok((entry.original, false));
                }
                Some(Slot::Degraded(_, last_error)) => {
                    warn!("{} is degraded, uninstall it before installing again", key);
                    return Err(HookError::RevertFailed {
                        key,
                        source: last_error.clone(),
                    });
                }
                Some(Slot::Installing) | Some(Slot::Uninstalling) => {
                    slots = self.wait_for_transition(slots, &key)?;
                }
            }
        }
        slots.insert(key.clone(), Slot::Installing);
        drop(slots);

        let guard = InstallingGuard {
            registry: self,
            key: &key,
        };
        let result = self.resolve_and_patch(&key, replacement, slot);
        std::mem::forget(guard);

        let mut slots = self.lock_slots();
        let outcome = match result {
            Ok(entry) => {
                let original = entry.original;
                info!(
                    "hooked {} at {:#x} -> {:#x} (original at {:#x})",
                    key,
                    entry.record.target(),
                    replacement,
                    original
                );
                slots.insert(key, Slot::Installed(entry));
                Ok((original, true))
            }
            Err(err) => {
                slots.remove(&key);
                self.counters.install_failures.fetch_add(1, Ordering::Relaxed);
                warn!("installing {} failed: {}", key, err);
                Err(err)
            }
        };
        self.changed.notify_all();
        outcome
    }

    unsafe fn resolve_and_patch(
        &self,
        key: &HookKey,
        replacement: usize,
        slot: Option<&'static OriginalSlot>,
    ) -> Result<HookEntry, HookError> {
        let resolved = self.resolver.resolve(&key.library, &key.symbol)?;
        debug!("{} resolved to {:#x}", key, resolved.address);

        let record = {
            let mut patched = self.lock_patched();
            // 別名のシンボルが同じ関数を指していることがある
            if let Some(owner) = patched.get(&resolved.address) {
                return Err(HookError::UnsafeTarget {
                    address: resolved.address,
                    reason: format!("already patched by {}", owner),
                });
            }
            let record = self.patcher.apply(resolved.address, replacement, slot)?;
            patched.insert(record.target(), key.clone());
            record
        };
        self.counters.patches_applied.fetch_add(1, Ordering::Relaxed);

        Ok(HookEntry {
            original: record.original_entry(),
            record,
            slot,
            _library: resolved.handle,
        })
    }

    fn uninstall_key(&self, key: &HookKey) -> Result<(), HookError> {
        let mut slots = self.lock_slots();
        let entry = loop {
            match slots.remove(key) {
                None => return Ok(()),
                Some(Slot::Installed(entry)) | Some(Slot::Degraded(entry, _)) => {
                    slots.insert(key.clone(), Slot::Uninstalling);
                    break entry;
                }
                Some(busy) => {
                    slots.insert(key.clone(), busy);
                    slots = self.wait_for_transition(slots, key)?;
                }
            }
        };
        drop(slots);

        let mut guard = UninstallingGuard {
            registry: self,
            key,
            entry: Some(entry),
        };
        let result = guard.revert();
        let entry = guard.disarm();

        let mut slots = self.lock_slots();
        let outcome = match result {
            Ok(()) => {
                slots.remove(key);
                self.counters.patches_reverted.fetch_add(1, Ordering::Relaxed);
                if let Some(slot) = entry.as_ref().and_then(|entry| entry.slot) {
                    slot.clear();
                }
                info!("unhooked {}", key);
                Ok(())
            }
            Err(err) => {
                error!("reverting {} failed, keeping it degraded: {}", key, err);
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                match entry {
                    Some(entry) => {
                        slots.insert(key.clone(), Slot::Degraded(entry, err.clone()));
                    }
                    None => {
                        slots.remove(key);
                    }
                }
                Err(HookError::RevertFailed {
                    key: key.clone(),
                    source: err,
                })
            }
        };
        self.changed.notify_all();
        drop(slots);
        outcome
    }

    /// `patched`のロックの下で書き戻し、成功したらアドレスを手放す
    fn revert_entry(&self, entry: &mut HookEntry) -> Result<(), PatchError> {
        let mut patched = self.lock_patched();
        unsafe { self.patcher.revert(&mut entry.record) }?;
        patched.remove(&entry.record.target());
        Ok(())
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("hooks left in place at registry drop: {}", err);
        }
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        for (key, slot) in slots.drain() {
            if let Slot::Installed(entry) | Slot::Degraded(entry, _) = slot {
                // 書き換えたコードがサンクへ飛ぶので解放しない
                warn!("leaking {} with its thunk at {:#x}", key, entry.original);
                std::mem::forget(entry);
            }
        }
    }
}
