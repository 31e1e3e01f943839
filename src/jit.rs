//! JIT host capability
//!
//! The runtime never loads native code itself. An embedder registers a
//! [`JitHost`] that accepts a [`KernelModule`] and hands back an opaque handle;
//! the handle is released through the same host when the compiled expression is
//! dropped. [`InProcessHost`] is the bundled host: it verifies the module and
//! runs it on the kernel machine.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::kernel::KernelModule;

/// Opaque handle to an instantiated kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Instantiates and frees lowered kernels
pub trait JitHost: Send + Sync {
    fn name(&self) -> &str;

    /// Instantiate `module`, or decline with `None`
    fn instantiate(&self, module: &KernelModule) -> Option<KernelHandle>;

    fn free(&self, handle: KernelHandle);
}

/// Host that keeps kernels in process
#[derive(Debug, Default)]
pub struct InProcessHost {
    next: AtomicU64,
    live: Mutex<HashSet<KernelHandle>>,
}

impl InProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles instantiated and not yet freed
    pub fn live_kernels(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl JitHost for InProcessHost {
    fn name(&self) -> &str {
        "in-process"
    }

    fn instantiate(&self, module: &KernelModule) -> Option<KernelHandle> {
        if let Err(message) = module.verify() {
            warn!(kernel = %module.name, %message, "kernel rejected");
            return None;
        }
        let handle = KernelHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(handle);
        debug!(kernel = %module.name, handle = handle.0, instructions = module.instruction_count(), "kernel instantiated");
        Some(handle)
    }

    fn free(&self, handle: KernelHandle) {
        if !self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&handle) {
            warn!(handle = handle.0, "free of unknown kernel handle");
        }
    }
}

/// A kernel instantiated by a host; freed on drop
pub struct JitKernel {
    module: KernelModule,
    handle: KernelHandle,
    host: Arc<dyn JitHost>,
}

impl JitKernel {
    /// Ask `host` to instantiate `module`. Modules failing [`KernelModule::verify`]
    /// never reach the host.
    pub fn instantiate(module: KernelModule, host: Arc<dyn JitHost>) -> Option<Self> {
        if let Err(message) = module.verify() {
            warn!(kernel = %module.name, %message, "kernel failed verification");
            return None;
        }
        let handle = host.instantiate(&module)?;
        Some(Self { module, handle, host })
    }

    pub fn module(&self) -> &KernelModule {
        &self.module
    }

    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn host_name(&self) -> &str {
        self.host.name()
    }
}

impl fmt::Debug for JitKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitKernel")
            .field("kernel", &self.module.name)
            .field("handle", &self.handle)
            .field("host", &self.host.name())
            .finish()
    }
}

impl Drop for JitKernel {
    fn drop(&mut self) {
        self.host.free(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FpMode;
    use crate::dtype::Dtype;
    use crate::kernel::Instr;
    use pretty_assertions::assert_eq;

    fn module(code: Vec<Instr>) -> KernelModule {
        KernelModule {
            name: "k".to_string(),
            inputs: Vec::new(),
            locals: Vec::new(),
            functions: Vec::new(),
            output: Dtype::Int64,
            fp: FpMode::Strict,
            compiler: None,
            registers: 0,
            code,
            reductions: Vec::new(),
        }
    }

    #[test]
    fn test_instantiate_and_free_on_drop() {
        let host = Arc::new(InProcessHost::new());
        let shared: Arc<dyn JitHost> = host.clone();
        let a = JitKernel::instantiate(module(vec![Instr::MissingReturn]), shared.clone()).unwrap();
        let b = JitKernel::instantiate(module(vec![Instr::MissingReturn]), shared).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(host.live_kernels(), 2);
        assert_eq!(a.host_name(), "in-process");
        drop(a);
        assert_eq!(host.live_kernels(), 1);
        drop(b);
        assert_eq!(host.live_kernels(), 0);
    }

    #[test]
    fn test_rejects_bad_jump() {
        let host: Arc<dyn JitHost> = Arc::new(InProcessHost::new());
        assert!(JitKernel::instantiate(module(vec![Instr::Jmp(7)]), host).is_none());
    }

    struct Declining;

    impl JitHost for Declining {
        fn name(&self) -> &str {
            "declining"
        }

        fn instantiate(&self, _module: &KernelModule) -> Option<KernelHandle> {
            None
        }

        fn free(&self, _handle: KernelHandle) {}
    }

    #[test]
    fn test_declining_host() {
        let host: Arc<dyn JitHost> = Arc::new(Declining);
        assert!(JitKernel::instantiate(module(vec![Instr::MissingReturn]), host).is_none());
    }

    /// Accepts anything and counts what it was offered
    #[derive(Default)]
    struct Permissive {
        offered: AtomicU64,
    }

    impl JitHost for Permissive {
        fn name(&self) -> &str {
            "permissive"
        }

        fn instantiate(&self, _module: &KernelModule) -> Option<KernelHandle> {
            Some(KernelHandle(self.offered.fetch_add(1, Ordering::Relaxed)))
        }

        fn free(&self, _handle: KernelHandle) {}
    }

    #[test]
    fn test_unbalanced_stack_never_reaches_host() {
        let host = Arc::new(Permissive::default());
        let shared: Arc<dyn JitHost> = host.clone();
        assert!(JitKernel::instantiate(module(vec![Instr::Return]), shared.clone()).is_none());
        assert_eq!(host.offered.load(Ordering::Relaxed), 0);

        let ok = module(vec![Instr::Const(crate::value::Value::Int64(1)), Instr::Return]);
        assert!(JitKernel::instantiate(ok, shared).is_some());
        assert_eq!(host.offered.load(Ordering::Relaxed), 1);
    }
}
